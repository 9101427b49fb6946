use std::{
    cmp::Ordering,
    fmt,
    io::{self, ErrorKind},
    path::Path,
    str::FromStr,
};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

/// An opaque identifier of one aggregated model snapshot.
///
/// Versions minted by the coordinator are decimal millisecond timestamps.
/// Versions are ordered by length first, so decimal versions compare
/// numerically. Clients must not rely on the format.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelVersion(String);

impl Ord for ModelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ModelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl ModelVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ModelVersion {
    fn from(version: u64) -> Self {
        Self(version.to_string())
    }
}

/// The identity of a client. It survives reconnects.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, From, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a fresh random client id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Loads the client id stored at `path`, or generates a new one and stores it there.
    ///
    /// # Errors
    /// Fails if the file can't be read or written, or if it doesn't hold a client id.
    pub async fn load_or_generate(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path).await {
            Ok(contents) => contents
                .parse()
                .map_err(|err| io::Error::new(ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let id = Self::generate();
                fs::write(path, format!("{}\n", id)).await?;
                Ok(id)
            }
            Err(err) => Err(err),
        }
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// The training parameters the coordinator hands out to every client.
///
/// Clients treat them as read-only; each model download replaces them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientHyperparams {
    /// The number of buffered examples that triggers one training iteration.
    pub examples_per_update: usize,
    /// The number of epochs of one training iteration.
    pub epochs: u32,
    /// The mini-batch size of one training iteration.
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Standard deviation of the Gaussian noise added to uploaded weights.
    /// `0` disables the noise.
    pub weight_noise_stddev: f32,
}

impl Default for ClientHyperparams {
    fn default() -> Self {
        Self {
            examples_per_update: 5,
            epochs: 5,
            batch_size: 32,
            learning_rate: 0.001,
            weight_noise_stddev: 0.,
        }
    }
}

impl fmt::Display for ClientHyperparams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examples_per_update={} epochs={} batch_size={} learning_rate={} weight_noise_stddev={}",
            self.examples_per_update,
            self.epochs,
            self.batch_size,
            self.learning_rate,
            self.weight_noise_stddev
        )
    }
}
