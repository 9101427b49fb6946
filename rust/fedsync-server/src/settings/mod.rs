//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

#[cfg(test)]
mod tests;

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedsync_core::{
    aggregation::{AggregationError, AggregationPolicy},
    model::{DenseModel, UnitError},
    transport::DEFAULT_MAX_FRAME_LENGTH,
    ClientHyperparams,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub aggregation: AggregationSettings,
    #[validate]
    pub client: ClientSettings,
    #[validate]
    pub model: ModelSettings,
    #[serde(default)]
    #[validate]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("fedsync")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Network settings.
pub struct ApiSettings {
    /// The address the coordinator accepts client connections on.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "127.0.0.1:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: SocketAddr,

    /// The maximal size of a single message frame, in bytes.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

#[derive(Debug, Deserialize, Validate, Clone)]
#[validate(schema(function = "validate_aggregation"))]
/// Aggregation settings.
pub struct AggregationSettings {
    /// The number of updates for the current version that triggers an aggregation. Must be at
    /// least `1`. `min_updates_per_version` is accepted as an alias.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// updates_per_version = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_AGGREGATION__UPDATES_PER_VERSION=3
    /// ```
    #[validate(range(min = 1))]
    #[serde(alias = "min_updates_per_version")]
    pub updates_per_version: usize,

    /// The aggregation policy: `mean`, `weighted_mean` or `weighted_delta`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// policy = "weighted_mean"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_AGGREGATION__POLICY=mean
    /// ```
    #[serde(default = "default_policy")]
    pub policy: String,
}

fn default_policy() -> String {
    AggregationPolicy::default().to_string()
}

impl AggregationSettings {
    /// Parses the configured policy.
    ///
    /// # Errors
    /// Fails with [`AggregationError::UnsupportedAggregation`] for an unknown policy.
    pub fn policy(&self) -> Result<AggregationPolicy, AggregationError> {
        self.policy.parse()
    }
}

fn validate_aggregation(s: &AggregationSettings) -> Result<(), ValidationError> {
    s.policy()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unsupported aggregation policy"))
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_client"))]
/// The training parameters handed out to clients.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [client]
/// examples_per_update = 5
/// epochs = 5
/// batch_size = 32
/// learning_rate = 0.001
/// weight_noise_stddev = 0.0
/// ```
///
/// **Environment variable**
/// ```text
/// FEDSYNC_CLIENT__EXAMPLES_PER_UPDATE=10
/// ```
pub struct ClientSettings {
    #[validate(range(min = 1))]
    pub examples_per_update: usize,
    #[validate(range(min = 1))]
    pub epochs: u32,
    #[validate(range(min = 1))]
    pub batch_size: usize,
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_noise_stddev: f32,
}

fn validate_client(s: &ClientSettings) -> Result<(), ValidationError> {
    if s.learning_rate > 0. && s.weight_noise_stddev >= 0. {
        Ok(())
    } else {
        Err(ValidationError::new("invalid learning rate or noise"))
    }
}

impl From<ClientSettings> for ClientHyperparams {
    fn from(settings: ClientSettings) -> Self {
        Self {
            examples_per_update: settings.examples_per_update,
            epochs: settings.epochs,
            batch_size: settings.batch_size,
            learning_rate: settings.learning_rate,
            weight_noise_stddev: settings.weight_noise_stddev,
        }
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// The initial global model, used when no stored version exists.
pub struct ModelSettings {
    /// The input size followed by the output size of every dense layer.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// layers = [4, 8, 1]
    /// ```
    #[validate(length(min = 2))]
    pub layers: Vec<usize>,
    /// Indices of layers excluded from training and from the shared weight set.
    #[serde(default)]
    pub frozen_layers: Vec<usize>,
    /// Seed of the weight initialization.
    #[serde(default)]
    pub seed: u64,
}

impl ModelSettings {
    /// Builds the initial model.
    pub fn build(&self) -> Result<DenseModel, UnitError> {
        let mut model = DenseModel::with_sizes(&self.layers, self.seed)?;
        for layer in &self.frozen_layers {
            model.set_trainable(*layer, false)?;
        }
        Ok(model)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Deserialize, Validate, Clone)]
#[validate(schema(function = "validate_storage"))]
/// Storage settings.
pub struct StorageSettings {
    /// Where model versions and pending updates are kept: `memory` or `file`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// backend = "file"
    /// dir = "/var/lib/fedsync"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_STORAGE__BACKEND=file
    /// FEDSYNC_STORAGE__DIR=/var/lib/fedsync
    /// ```
    pub backend: StorageBackend,
    /// The root directory of the `file` backend.
    pub dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            dir: None,
        }
    }
}

fn validate_storage(s: &StorageSettings) -> Result<(), ValidationError> {
    match (s.backend, &s.dir) {
        (StorageBackend::File, None) => Err(ValidationError::new("file storage without dir")),
        _ => Ok(()),
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
/// Process settings.
pub struct ServerSettings {
    /// Stop the coordinator once the last connected client disconnects.
    #[serde(default)]
    pub exit_on_last_disconnect: bool,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSYNC_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
