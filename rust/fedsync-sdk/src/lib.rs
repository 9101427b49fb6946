#![cfg_attr(docsrs, feature(doc_cfg))]
//! The client side of fedsync.
//!
//! A [`ClientSyncAgent`] wraps a [`TrainableUnit`] and keeps it in sync with
//! the coordinator. The application feeds it examples with
//! [`ClientSyncAgent::federated_update`]; the agent trains on them in fixed
//! size chunks, uploads the trained weights and reverts the unit to the last
//! model it received, so that every update is trained from a global model.
//!
//! ```no_run
//! # use fedsync_core::{model::DenseModel, Weight, ClientId};
//! # use fedsync_sdk::{AgentSettings, ClientSyncAgent, TcpConnector};
//! # async fn example(x: Weight, y: Weight) -> Result<(), Box<dyn std::error::Error>> {
//! let unit = DenseModel::with_sizes(&[4, 8, 1], 0)?;
//! let settings = AgentSettings::default();
//! let mut connector = TcpConnector::new("127.0.0.1:8081", settings.max_frame_length);
//! let mut agent = ClientSyncAgent::new(unit, ClientId::generate(), settings);
//! agent.connect(&mut connector).await?;
//! let uploads = agent.federated_update(&x, &y).await?;
//! println!("{} updates uploaded", uploads);
//! # Ok(())
//! # }
//! ```
//!
//! [`TrainableUnit`]: fedsync_core::model::TrainableUnit

mod agent;
pub mod connector;
pub mod settings;

pub use self::{
    agent::{AgentError, AgentPhase, AgentStats, ClientSyncAgent},
    connector::{Connector, LocalConnector, TcpConnector},
    settings::AgentSettings,
};
