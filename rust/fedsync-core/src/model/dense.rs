use async_trait::async_trait;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{check_examples, FitConfig, TrainableUnit, UnitError};
use crate::tensor::{self, Weight};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
}

impl Activation {
    fn f(self, z: f32) -> f32 {
        match self {
            Activation::Linear => z,
            Activation::Relu => z.max(0.),
            Activation::Sigmoid => 1. / (1. + (-z).exp()),
        }
    }

    fn df(self, z: f32) -> f32 {
        match self {
            Activation::Linear => 1.,
            Activation::Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Activation::Sigmoid => {
                let s = self.f(z);
                s * (1. - s)
            }
        }
    }
}

/// A fully connected layer computing `activation(x · kernel + bias)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLayer {
    kernel: Array2<f32>,
    bias: Array1<f32>,
    activation: Activation,
    trainable: bool,
}

impl DenseLayer {
    /// Creates a trainable layer from its parameters.
    ///
    /// # Errors
    /// Fails if the bias does not have one entry per output.
    pub fn new(
        kernel: Array2<f32>,
        bias: Array1<f32>,
        activation: Activation,
    ) -> Result<Self, UnitError> {
        if bias.len() != kernel.ncols() {
            return Err(UnitError::ShapeMismatch(format!(
                "bias of length {} for a kernel with {} outputs",
                bias.len(),
                kernel.ncols()
            )));
        }
        Ok(Self {
            kernel,
            bias,
            activation,
            trainable: true,
        })
    }

    /// Creates a trainable layer with He-initialized weights and zero bias.
    pub fn random<R: Rng>(
        inputs: usize,
        outputs: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, UnitError> {
        let std_dev = (2. / inputs.max(1) as f32).sqrt();
        let normal = Normal::new(0., std_dev)
            .map_err(|e| UnitError::ShapeMismatch(format!("cannot initialize layer: {}", e)))?;
        let kernel = Array2::from_shape_simple_fn((inputs, outputs), || normal.sample(rng));
        Self::new(kernel, Array1::zeros(outputs), activation)
    }

    /// Sets whether the layer is updated by training and part of the weight
    /// set.
    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.kernel.ncols()
    }

    fn forward(&self, x: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let z = x.dot(&self.kernel) + &self.bias;
        let activation = self.activation;
        let a = z.mapv(|v| activation.f(v));
        (z, a)
    }
}

/// A sequential model of dense layers trained with mini-batch SGD on the
/// mean squared error.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseModel {
    layers: Vec<DenseLayer>,
}

impl DenseModel {
    /// Creates a model from its layers.
    ///
    /// # Errors
    /// Fails if there are no layers or consecutive layers do not fit together.
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self, UnitError> {
        if layers.is_empty() {
            return Err(UnitError::ShapeMismatch(
                "a model needs at least one layer".to_string(),
            ));
        }
        for pair in layers.windows(2) {
            if pair[0].outputs() != pair[1].inputs() {
                return Err(UnitError::ShapeMismatch(format!(
                    "a layer with {} outputs cannot feed a layer with {} inputs",
                    pair[0].outputs(),
                    pair[1].inputs()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Creates a randomly initialized model. `sizes` lists the input size
    /// followed by the output size of every layer. Hidden layers use ReLU, the
    /// last one is linear.
    pub fn with_sizes(sizes: &[usize], seed: u64) -> Result<Self, UnitError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let last = sizes.len().saturating_sub(2);
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let activation = if i == last {
                    Activation::Linear
                } else {
                    Activation::Relu
                };
                DenseLayer::random(pair[0], pair[1], activation, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(layers)
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    /// Freezes or unfreezes a layer.
    pub fn set_trainable(&mut self, layer: usize, trainable: bool) -> Result<(), UnitError> {
        let num_layers = self.layers.len();
        let layer = self.layers.get_mut(layer).ok_or_else(|| {
            UnitError::ShapeMismatch(format!("layer {} of {}", layer, num_layers))
        })?;
        layer.trainable = trainable;
        Ok(())
    }

    /// Runs the model on a batch of inputs.
    pub fn predict(&self, x: &Weight) -> Result<Weight, UnitError> {
        let rows = x.num_rows();
        let outputs = self.forward(&to_matrix(x, self.layers[0].inputs())?);
        Weight::from_f32(
            vec![rows, self.output_dim()],
            outputs.iter().copied().collect(),
        )
        .map_err(UnitError::from)
    }

    fn output_dim(&self) -> usize {
        self.layers.last().map(DenseLayer::outputs).unwrap_or(0)
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        self.layers
            .iter()
            .fold(x.clone(), |a, layer| layer.forward(&a).1)
    }

    fn sgd_step(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>, learning_rate: f32) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut zs = Vec::with_capacity(self.layers.len());
        let mut a = x.to_owned();
        for layer in &self.layers {
            let (z, next) = layer.forward(&a);
            inputs.push(a);
            zs.push(z);
            a = next;
        }

        let mut delta = (&a - &y) * (2. / a.len().max(1) as f32);
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            let activation = layer.activation;
            delta.zip_mut_with(&zs[i], |d, &z| *d *= activation.df(z));
            let previous = delta.dot(&layer.kernel.t());
            if layer.trainable {
                let dw = inputs[i].t().dot(&delta);
                let db = delta.sum_axis(Axis(0));
                layer.kernel.scaled_add(-learning_rate, &dw);
                layer.bias.scaled_add(-learning_rate, &db);
            }
            delta = previous;
        }
    }
}

fn to_matrix(weight: &Weight, cols: usize) -> Result<Array2<f32>, UnitError> {
    Array2::from_shape_vec((weight.num_rows(), cols), weight.to_f32_vec())
        .map_err(|e| UnitError::ShapeMismatch(e.to_string()))
}

fn mse(prediction: &Array2<f32>, y: &Array2<f32>) -> f32 {
    (prediction - y).mapv(|v| v.powi(2)).mean().unwrap_or_default()
}

#[async_trait]
impl TrainableUnit for DenseModel {
    async fn fit(&mut self, x: &Weight, y: &Weight, config: &FitConfig) -> Result<(), UnitError> {
        let n = check_examples(x, y, &self.input_shape(), &self.output_shape())?;
        let x = to_matrix(x, self.layers[0].inputs())?;
        let y = to_matrix(y, self.output_dim())?;
        let batch_size = config.batch_size.max(1);

        for _ in 0..config.epochs {
            let mut start = 0;
            while start < n {
                let end = (start + batch_size).min(n);
                self.sgd_step(
                    x.slice(s![start..end, ..]),
                    y.slice(s![start..end, ..]),
                    config.learning_rate,
                );
                start = end;
            }
        }
        Ok(())
    }

    fn get_weights(&self) -> Vec<Weight> {
        self.layers
            .iter()
            .filter(|layer| layer.trainable)
            .flat_map(|layer| {
                [
                    Weight::from_f32(
                        vec![layer.inputs(), layer.outputs()],
                        layer.kernel.iter().copied().collect(),
                    ),
                    Weight::from_f32(vec![layer.outputs()], layer.bias.to_vec()),
                ]
            })
            // the shapes are taken from the arrays themselves
            .filter_map(Result::ok)
            .collect()
    }

    fn set_weights(&mut self, weights: &[Weight]) -> Result<(), UnitError> {
        let trainable = self.layers.iter().filter(|l| l.trainable).count();
        if weights.len() != 2 * trainable {
            return Err(UnitError::ShapeMismatch(format!(
                "{} weights for {} trainable layers",
                weights.len(),
                trainable
            )));
        }

        let mut updated = Vec::with_capacity(trainable);
        for (layer, pair) in self
            .layers
            .iter()
            .filter(|l| l.trainable)
            .zip(weights.chunks_exact(2))
        {
            let (kernel, bias) = (&pair[0], &pair[1]);
            let (inputs, outputs) = (layer.inputs(), layer.outputs());
            match (kernel.as_f32(), bias.as_f32()) {
                (Some(k), Some(b))
                    if kernel.shape() == [inputs, outputs] && bias.shape() == [outputs] =>
                {
                    let k = Array2::from_shape_vec((inputs, outputs), k.to_vec())
                        .map_err(|e| UnitError::ShapeMismatch(e.to_string()))?;
                    updated.push((k, Array1::from(b.to_vec())));
                }
                _ => {
                    return Err(UnitError::ShapeMismatch(format!(
                        "expected float32 weights of shape {:?} and {:?}, got {} {:?} and {} {:?}",
                        [inputs, outputs],
                        [outputs],
                        kernel.dtype(),
                        kernel.shape(),
                        bias.dtype(),
                        bias.shape()
                    )))
                }
            }
        }

        for (layer, (kernel, bias)) in self
            .layers
            .iter_mut()
            .filter(|l| l.trainable)
            .zip(updated)
        {
            layer.kernel = kernel;
            layer.bias = bias;
        }
        Ok(())
    }

    fn evaluate(&self, x: &Weight, y: &Weight) -> Result<Vec<f32>, UnitError> {
        check_examples(x, y, &self.input_shape(), &self.output_shape())?;
        let prediction = self.forward(&to_matrix(x, self.layers[0].inputs())?);
        let y = to_matrix(y, self.output_dim())?;
        Ok(vec![mse(&prediction, &y)])
    }

    async fn save(&mut self, locator: &str) -> Result<(), UnitError> {
        let weights = tensor::serialize_all(&self.get_weights());
        let bytes = bincode::serialize(&weights).map_err(|e| {
            UnitError::Save(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        tokio::fs::write(locator, bytes).await?;
        Ok(())
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.layers[0].inputs()]
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.output_dim()]
    }
}
