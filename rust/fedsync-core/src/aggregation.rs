//! Aggregation of client updates into a new global model.
//!
//! The weight lists of all contributions are [`stack`]ed into one tensor per
//! parameter position and reduced along the leading axis. The reduction is
//! computed in `float32` and cast back to the element type of the global
//! model.
//!
//! [`stack`]: crate::tensor::stack

use std::{fmt, str::FromStr};

use ndarray::{ArrayD, Axis, IxDyn};
use thiserror::Error;

use crate::tensor::{self, CodecError, SerializedWeight, Weight};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("unsupported aggregation policy: {0}")]
    UnsupportedAggregation(String),
    #[error("no updates to aggregate")]
    NoUpdates,
    #[error("invalid update: {0}")]
    Codec(#[from] CodecError),
    #[error("updates do not match the global model: {0}")]
    Layout(String),
}

/// The weights one client uploaded, with the number of examples they were
/// trained on.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub weights: Vec<SerializedWeight>,
    pub num_examples: u64,
}

/// How the stacked updates are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationPolicy {
    /// The unweighted elementwise mean of the uploaded weights.
    Mean,
    /// `Σ (n_k / N) · w_k`, with `n_k` the example count of update `k` and
    /// `N` the total.
    #[default]
    WeightedMean,
    /// The uploads are deltas against the global model:
    /// `baseline + Σ (n_k / N) · w_k`.
    WeightedDelta,
}

impl AggregationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationPolicy::Mean => "mean",
            AggregationPolicy::WeightedMean => "weighted_mean",
            AggregationPolicy::WeightedDelta => "weighted_delta",
        }
    }

    /// Aggregates the contributions into a new weight set with the layout of
    /// `baseline`.
    ///
    /// # Errors
    /// Fails if there are no contributions, if the contributions are ragged or
    /// undecodable, or if they do not match the layout of `baseline`.
    pub fn aggregate(
        self,
        baseline: &[Weight],
        contributions: &[Contribution],
    ) -> Result<Vec<Weight>, AggregationError> {
        if contributions.is_empty() {
            return Err(AggregationError::NoUpdates);
        }
        let updates: Vec<Vec<SerializedWeight>> =
            contributions.iter().map(|c| c.weights.clone()).collect();
        let stacked = tensor::stack(&updates)?;
        if stacked.len() != baseline.len() {
            return Err(AggregationError::Layout(format!(
                "{} weights instead of {}",
                stacked.len(),
                baseline.len()
            )));
        }

        let coefficients = self.coefficients(contributions);
        stacked
            .iter()
            .zip(baseline)
            .map(|(stacked, base)| self.reduce(&tensor::deserialize(stacked)?, base, &coefficients))
            .collect()
    }

    fn coefficients(self, contributions: &[Contribution]) -> Vec<f32> {
        let k = contributions.len() as f64;
        let total: u64 = contributions.iter().map(|c| c.num_examples).sum();
        match self {
            AggregationPolicy::WeightedMean | AggregationPolicy::WeightedDelta if total > 0 => {
                contributions
                    .iter()
                    .map(|c| (c.num_examples as f64 / total as f64) as f32)
                    .collect()
            }
            _ => vec![(1. / k) as f32; contributions.len()],
        }
    }

    fn reduce(
        self,
        stacked: &Weight,
        base: &Weight,
        coefficients: &[f32],
    ) -> Result<Weight, AggregationError> {
        if stacked.row_shape() != base.shape() || stacked.dtype() != base.dtype() {
            return Err(AggregationError::Layout(format!(
                "{} {:?} cannot be aggregated into {} {:?}",
                stacked.dtype(),
                stacked.row_shape(),
                base.dtype(),
                base.shape()
            )));
        }
        let array = ArrayD::from_shape_vec(IxDyn(stacked.shape()), stacked.to_f32_vec())
            .map_err(|e| AggregationError::Layout(e.to_string()))?;

        let reduced = match self {
            AggregationPolicy::Mean => array
                .mean_axis(Axis(0))
                .ok_or(AggregationError::NoUpdates)?,
            AggregationPolicy::WeightedMean => weighted_sum(&array, coefficients),
            AggregationPolicy::WeightedDelta => {
                let mut reduced = weighted_sum(&array, coefficients);
                let base = ArrayD::from_shape_vec(IxDyn(base.shape()), base.to_f32_vec())
                    .map_err(|e| AggregationError::Layout(e.to_string()))?;
                reduced += &base;
                reduced
            }
        };

        Ok(Weight::from_f32_as(
            base.dtype(),
            base.shape().to_vec(),
            reduced.iter().copied().collect(),
        )?)
    }
}

fn weighted_sum(stacked: &ArrayD<f32>, coefficients: &[f32]) -> ArrayD<f32> {
    let mut sum = ArrayD::<f32>::zeros(IxDyn(&stacked.shape()[1..]));
    for (update, coefficient) in stacked.axis_iter(Axis(0)).zip(coefficients) {
        sum.scaled_add(*coefficient, &update);
    }
    sum
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationPolicy {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(AggregationPolicy::Mean),
            "weighted_mean" => Ok(AggregationPolicy::WeightedMean),
            "weighted_delta" => Ok(AggregationPolicy::WeightedDelta),
            other => Err(AggregationError::UnsupportedAggregation(other.to_string())),
        }
    }
}
