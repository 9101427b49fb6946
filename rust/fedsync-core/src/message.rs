//! The messages exchanged between a client and the coordinator.
//!
//! Every connection starts with a [`Hello`] from the client, answered by a
//! [`Download`] of the current model. Afterwards the client sends [`Upload`]s
//! and [`Data`], which the coordinator acknowledges by sequence number, and the
//! coordinator pushes a new [`Download`] whenever it publishes a new model
//! version.

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    common::{ClientHyperparams, ClientId, ModelVersion},
    tensor::SerializedWeight,
};

/// The first message on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub client_id: ClientId,
}

/// A snapshot of the global model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub version: ModelVersion,
    pub weights: Vec<SerializedWeight>,
    pub hyperparams: ClientHyperparams,
}

/// Locally trained weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    /// Sequence number echoed by the acknowledgement.
    pub seq: u64,
    /// The version the weights were trained from.
    pub version: ModelVersion,
    pub weights: Vec<SerializedWeight>,
    pub client_id: ClientId,
    /// The number of examples the weights were trained on.
    pub num_examples: u64,
    /// Evaluation metrics of the trained weights, if the client reports them.
    pub metrics: Option<Vec<f32>>,
}

/// Raw examples sent for diagnostics. They are never aggregated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub seq: u64,
    pub x: SerializedWeight,
    pub y: SerializedWeight,
}

#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello(Hello),
    Upload(Upload),
    Data(Data),
}

#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
pub enum ServerMessage {
    Download(Download),
    /// Acknowledges the [`Upload`] or [`Data`] with the same sequence number.
    #[from(ignore)]
    Ack(u64),
}
