use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use fedsync_core::transport::DEFAULT_MAX_FRAME_LENGTH;

/// The settings of a [`ClientSyncAgent`].
///
/// [`ClientSyncAgent`]: crate::ClientSyncAgent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// How long to wait for the initial model after connecting.
    pub connection_timeout: Duration,
    /// How long to wait for the acknowledgement of an upload.
    pub upload_timeout: Duration,
    /// Where the client id is stored. Without a path, a new client id is generated for every
    /// agent.
    pub identity_path: Option<PathBuf>,
    /// The maximal size of a single message frame, in bytes.
    pub max_frame_length: usize,
    /// Attach the evaluation metrics of the trained weights to every upload.
    pub report_metrics: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            upload_timeout: Duration::from_secs(5),
            identity_path: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            report_metrics: false,
        }
    }
}
