use std::fmt;

use async_trait::async_trait;

use super::{check_examples, FitConfig, TrainableUnit, UnitError};
use crate::tensor::Weight;

/// Computes the loss of `weights` on a batch `(x, y)` together with the
/// gradient of the loss with respect to every weight.
pub type GradientFn =
    Box<dyn Fn(&[Weight], &Weight, &Weight) -> Result<(f32, Vec<Weight>), UnitError> + Send + Sync>;

/// A raw weight set trained with mini-batch SGD against a loss function.
///
/// Only `float32` weights are trained; weights of other element types are
/// carried along unchanged.
pub struct LossFnUnit {
    weights: Vec<Weight>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    loss: GradientFn,
}

impl fmt::Debug for LossFnUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossFnUnit")
            .field("weights", &self.weights)
            .field("input_shape", &self.input_shape)
            .field("output_shape", &self.output_shape)
            .finish()
    }
}

impl LossFnUnit {
    pub fn new<F>(
        weights: Vec<Weight>,
        input_shape: Vec<usize>,
        output_shape: Vec<usize>,
        loss: F,
    ) -> Self
    where
        F: Fn(&[Weight], &Weight, &Weight) -> Result<(f32, Vec<Weight>), UnitError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            weights,
            input_shape,
            output_shape,
            loss: Box::new(loss),
        }
    }

    fn apply_gradients(&mut self, gradients: &[Weight], learning_rate: f32) -> Result<(), UnitError> {
        if gradients.len() != self.weights.len() {
            return Err(UnitError::ShapeMismatch(format!(
                "{} gradients for {} weights",
                gradients.len(),
                self.weights.len()
            )));
        }
        for (weight, gradient) in self.weights.iter().zip(gradients) {
            if weight.shape() != gradient.shape() {
                return Err(UnitError::ShapeMismatch(format!(
                    "gradient of shape {:?} for a weight of shape {:?}",
                    gradient.shape(),
                    weight.shape()
                )));
            }
        }
        for (weight, gradient) in self.weights.iter_mut().zip(gradients) {
            if let (Some(w), Some(g)) = (weight.as_f32_mut(), gradient.as_f32()) {
                w.iter_mut().zip(g).for_each(|(w, g)| *w -= learning_rate * g);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TrainableUnit for LossFnUnit {
    async fn fit(&mut self, x: &Weight, y: &Weight, config: &FitConfig) -> Result<(), UnitError> {
        let n = check_examples(x, y, &self.input_shape, &self.output_shape)?;
        let batch_size = config.batch_size.max(1);
        for _ in 0..config.epochs {
            let mut start = 0;
            while start < n {
                let end = (start + batch_size).min(n);
                let (_, gradients) =
                    (self.loss)(&self.weights, &x.slice_rows(start, end)?, &y.slice_rows(start, end)?)?;
                self.apply_gradients(&gradients, config.learning_rate)?;
                start = end;
            }
        }
        Ok(())
    }

    fn get_weights(&self) -> Vec<Weight> {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: &[Weight]) -> Result<(), UnitError> {
        let matches = weights.len() == self.weights.len()
            && self
                .weights
                .iter()
                .zip(weights)
                .all(|(a, b)| a.shape() == b.shape() && a.dtype() == b.dtype());
        if !matches {
            return Err(UnitError::ShapeMismatch(
                "the weights do not match the layout of the unit".to_string(),
            ));
        }
        self.weights = weights.to_vec();
        Ok(())
    }

    fn evaluate(&self, x: &Weight, y: &Weight) -> Result<Vec<f32>, UnitError> {
        check_examples(x, y, &self.input_shape, &self.output_shape)?;
        let (loss, _) = (self.loss)(&self.weights, x, y)?;
        Ok(vec![loss])
    }

    fn input_shape(&self) -> Vec<usize> {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.output_shape.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // y = w · x, loss = mean((w · x - y)^2)
    fn scale_unit(w: f32) -> LossFnUnit {
        LossFnUnit::new(
            vec![Weight::from_f32(vec![1], vec![w]).unwrap()],
            vec![1],
            vec![1],
            |weights, x, y| {
                let w = weights[0].as_f32().map(|w| w[0]).unwrap_or_default();
                let xs = x.to_f32_vec();
                let ys = y.to_f32_vec();
                let n = xs.len().max(1) as f32;
                let (loss, grad) = xs.iter().zip(&ys).fold((0., 0.), |(l, g), (x, y)| {
                    let err = w * x - y;
                    (l + err * err / n, g + 2. * err * x / n)
                });
                Ok((loss, vec![Weight::from_f32(vec![1], vec![grad])?]))
            },
        )
    }

    fn data() -> (Weight, Weight) {
        (
            Weight::from_f32(vec![4, 1], vec![1., 2., 3., 4.]).unwrap(),
            Weight::from_f32(vec![4, 1], vec![2., 4., 6., 8.]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fit() {
        let (x, y) = data();
        let mut unit = scale_unit(0.);
        assert_eq!(unit.evaluate(&x, &y).unwrap(), vec![30.]);

        let config = FitConfig {
            epochs: 50,
            batch_size: 2,
            learning_rate: 0.02,
        };
        unit.fit(&x, &y, &config).await.unwrap();
        let w = unit.get_weights()[0].as_f32().unwrap()[0];
        assert!((w - 2.).abs() < 1e-3, "{}", w);
    }

    #[test]
    fn test_set_weights_checks_the_layout() {
        let mut unit = scale_unit(0.);
        assert!(unit
            .set_weights(&[Weight::from_f32(vec![1], vec![3.]).unwrap()])
            .is_ok());
        assert_eq!(
            unit.get_weights(),
            vec![Weight::from_f32(vec![1], vec![3.]).unwrap()]
        );
        assert!(unit
            .set_weights(&[Weight::from_f32(vec![2], vec![3., 3.]).unwrap()])
            .is_err());
        assert!(unit.set_weights(&[]).is_err());
    }
}
