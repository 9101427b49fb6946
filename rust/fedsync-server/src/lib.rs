#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsync coordinator
//!
//! The coordinator owns the global model of a federated training. Clients connect, receive the
//! current model version together with their training parameters, train locally and upload the
//! weights they trained, tagged with the version they started from. Once enough updates for the
//! current version have arrived, the coordinator aggregates them into a new version and pushes it
//! to every connected client.
//!
//! - [`aggregator`]: the single task that owns the model, collects updates and publishes
//!   versions, together with its request channel and event bus.
//! - [`transport`]: the per-connection sessions over TCP or in-process channels.
//! - [`storage`]: where versions and pending updates are persisted.
//! - [`settings`]: loading and validation of the configuration.
//!
//! The `coordinator` binary wires these together:
//!
//! ```text
//! coordinator -c configs/config.toml
//! ```

pub mod aggregator;
pub mod settings;
pub mod storage;
pub mod transport;
