#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsync: keep federated clients and their coordinator in sync
//!
//! `fedsync-core` holds everything the coordinator and its clients have to
//! agree on:
//!
//! - **Tensors**: the [`tensor`] module converts model parameters to and from
//!   a transport-safe record of `(dtype, shape, little-endian bytes)` and
//!   stacks the per-client records for aggregation.
//! - **Messages**: the [`message`] module defines the frames exchanged over a
//!   client connection, and [`transport`] turns a TCP stream or an in-process
//!   channel pair into a typed message channel.
//! - **Trainable units**: the [`model`] module defines the capability a model
//!   has to expose to take part in federated training, together with two small
//!   reference implementations.
//! - **Aggregation**: the [`aggregation`] module reduces a set of client
//!   updates into the next global model.
//!
//! The coordinator lives in `fedsync-server`, the client agent in
//! `fedsync-sdk`.

pub mod aggregation;
pub mod common;
pub mod message;
pub mod model;
pub mod tensor;
pub mod transport;

pub use self::{
    common::{ClientHyperparams, ClientId, ModelVersion},
    tensor::{CodecError, DType, SerializedWeight, TensorData, Weight},
};
