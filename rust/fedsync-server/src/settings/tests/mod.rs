use std::{env, io::Write};

use serial_test::serial;
use tempfile::NamedTempFile;

use super::{AggregationSettings, ClientSettings, Settings, StorageBackend, StorageSettings};
use fedsync_core::aggregation::AggregationPolicy;
use validator::Validate;

const BASE: &str = r#"
[log]
filter = "info"

[api]
bind_address = "127.0.0.1:0"

[client]
examples_per_update = 5
epochs = 5
batch_size = 32
learning_rate = 0.001

[model]
layers = [2, 1]
"#;

fn config_file(aggregation: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    write!(file, "{}\n{}", BASE, aggregation).unwrap();
    file
}

fn client_settings() -> ClientSettings {
    ClientSettings {
        examples_per_update: 5,
        epochs: 5,
        batch_size: 32,
        learning_rate: 0.001,
        weight_noise_stddev: 0.,
    }
}

#[test]
#[serial]
fn test_settings_new() {
    assert!(Settings::new("../../configs/config.toml").is_ok());
    assert!(Settings::new("").is_err());
}

#[test]
#[serial]
fn test_defaults() {
    let file = config_file("[aggregation]\nupdates_per_version = 2\n");
    let settings = Settings::new(file.path()).unwrap();
    assert_eq!(settings.aggregation.updates_per_version, 2);
    assert_eq!(
        settings.aggregation.policy().unwrap(),
        AggregationPolicy::WeightedMean
    );
    assert_eq!(settings.client.weight_noise_stddev, 0.);
    assert_eq!(settings.storage.backend, StorageBackend::Memory);
    assert!(!settings.server.exit_on_last_disconnect);
    assert_eq!(settings.model.seed, 0);
}

#[test]
#[serial]
fn test_quorum_alias() {
    let file = config_file("[aggregation]\nmin_updates_per_version = 4\n");
    let settings = Settings::new(file.path()).unwrap();
    assert_eq!(settings.aggregation.updates_per_version, 4);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = config_file("[aggregation]\nupdates_per_version = 2\npolicy = \"mean\"\n");
    env::set_var("FEDSYNC_AGGREGATION__UPDATES_PER_VERSION", "7");
    env::set_var("FEDSYNC_AGGREGATION__POLICY", "weighted_delta");
    let settings = Settings::new(file.path());
    env::remove_var("FEDSYNC_AGGREGATION__UPDATES_PER_VERSION");
    env::remove_var("FEDSYNC_AGGREGATION__POLICY");

    let settings = settings.unwrap();
    assert_eq!(settings.aggregation.updates_per_version, 7);
    assert_eq!(
        settings.aggregation.policy().unwrap(),
        AggregationPolicy::WeightedDelta
    );
}

#[test]
#[serial]
fn test_invalid_files_are_rejected() {
    let zero_quorum = config_file("[aggregation]\nupdates_per_version = 0\n");
    assert!(Settings::new(zero_quorum.path()).is_err());

    let unknown_policy = config_file("[aggregation]\nupdates_per_version = 1\npolicy = \"median\"\n");
    assert!(Settings::new(unknown_policy.path()).is_err());
}

#[test]
fn test_validate_aggregation() {
    let valid = AggregationSettings {
        updates_per_version: 1,
        policy: "mean".to_string(),
    };
    assert!(valid.validate().is_ok());
    assert!(AggregationSettings {
        updates_per_version: 0,
        ..valid.clone()
    }
    .validate()
    .is_err());
    assert!(AggregationSettings {
        policy: "median".to_string(),
        ..valid
    }
    .validate()
    .is_err());
}

#[test]
fn test_validate_client() {
    assert!(client_settings().validate().is_ok());
    assert!(ClientSettings {
        examples_per_update: 0,
        ..client_settings()
    }
    .validate()
    .is_err());
    assert!(ClientSettings {
        learning_rate: 0.,
        ..client_settings()
    }
    .validate()
    .is_err());
    assert!(ClientSettings {
        weight_noise_stddev: -1.,
        ..client_settings()
    }
    .validate()
    .is_err());
}

#[test]
fn test_validate_storage() {
    assert!(StorageSettings::default().validate().is_ok());
    assert!(StorageSettings {
        backend: StorageBackend::File,
        dir: None,
    }
    .validate()
    .is_err());
    assert!(StorageSettings {
        backend: StorageBackend::File,
        dir: Some("/tmp/fedsync".into()),
    }
    .validate()
    .is_ok());
}
