//! The capability a model has to expose to take part in federated training.
//!
//! How a model is trained is opaque to the synchronization protocol: the
//! client agent only fits the unit on a batch of examples, reads and writes its
//! weight set and asks it for evaluation metrics. Two implementations are
//! provided:
//!
//! - [`DenseModel`]: a structured model of dense layers, some of which may be
//!   frozen. Only the trainable layers contribute to the weight set.
//! - [`LossFnUnit`]: a raw weight set trained against a user supplied loss and
//!   gradient function.

mod dense;
mod loss_fn;

use async_trait::async_trait;
use thiserror::Error;

pub use self::{
    dense::{Activation, DenseLayer, DenseModel},
    loss_fn::{GradientFn, LossFnUnit},
};
use crate::{
    common::ClientHyperparams,
    tensor::{CodecError, Weight},
};

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid tensor: {0}")]
    Codec(#[from] CodecError),
    #[error("failed to save the model: {0}")]
    Save(#[from] std::io::Error),
}

/// The parameters of a single call to [`TrainableUnit::fit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub epochs: u32,
    pub batch_size: usize,
    pub learning_rate: f32,
}

impl From<&ClientHyperparams> for FitConfig {
    fn from(hyperparams: &ClientHyperparams) -> Self {
        Self {
            epochs: hyperparams.epochs,
            batch_size: hyperparams.batch_size,
            learning_rate: hyperparams.learning_rate,
        }
    }
}

#[async_trait]
pub trait TrainableUnit: Send {
    /// Trains the unit in place on the examples `x` with labels `y`. The
    /// leading dimension of both tensors is the example dimension.
    async fn fit(
        &mut self,
        x: &Weight,
        y: &Weight,
        config: &FitConfig,
    ) -> Result<(), UnitError>;

    /// Copies the current weight set.
    fn get_weights(&self) -> Vec<Weight>;

    /// Overwrites the weight set.
    ///
    /// # Errors
    /// Fails if the weights do not match the layout of the unit.
    fn set_weights(&mut self, weights: &[Weight]) -> Result<(), UnitError>;

    /// Computes evaluation metrics, the first one being the loss.
    fn evaluate(&self, x: &Weight, y: &Weight) -> Result<Vec<f32>, UnitError>;

    /// Persists the unit. Only the coordinator saves its model; the default
    /// does nothing.
    async fn save(&mut self, _locator: &str) -> Result<(), UnitError> {
        Ok(())
    }

    /// The shape of one input example.
    fn input_shape(&self) -> Vec<usize>;

    /// The shape of one label.
    fn output_shape(&self) -> Vec<usize>;
}

/// Checks that `x` and `y` hold the same number of examples of the expected
/// shapes.
pub fn check_examples(
    x: &Weight,
    y: &Weight,
    input_shape: &[usize],
    output_shape: &[usize],
) -> Result<usize, UnitError> {
    if x.shape().is_empty() || x.row_shape() != input_shape {
        return Err(UnitError::ShapeMismatch(format!(
            "inputs of shape {:?} do not match the input shape {:?}",
            x.shape(),
            input_shape
        )));
    }
    if y.shape().is_empty() || y.row_shape() != output_shape {
        return Err(UnitError::ShapeMismatch(format!(
            "labels of shape {:?} do not match the output shape {:?}",
            y.shape(),
            output_shape
        )));
    }
    if x.num_rows() != y.num_rows() {
        return Err(UnitError::ShapeMismatch(format!(
            "{} inputs but {} labels",
            x.num_rows(),
            y.num_rows()
        )));
    }
    Ok(x.num_rows())
}
