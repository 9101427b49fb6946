use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use fedsync_core::model::DenseModel;
use fedsync_server::{
    aggregator::AggregatorInitializer,
    settings::{
        AggregationSettings,
        ApiSettings,
        ClientSettings,
        ServerSettings,
        Settings,
        StorageBackend,
    },
    storage::{FileStore, InMemoryStore, VersionStore},
    transport::Sessions,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        aggregation: aggregation_settings,
        client: client_settings,
        model: model_settings,
        storage: storage_settings,
        server: server_settings,
        log: log_settings,
    } = settings;

    FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let model = model_settings
        .build()
        .expect("failed to build the initial model");
    info!(
        "initial model with layers {:?}, frozen {:?}",
        model_settings.layers, model_settings.frozen_layers
    );
    let settings = (api_settings, aggregation_settings, client_settings, server_settings);

    match (storage_settings.backend, storage_settings.dir) {
        (StorageBackend::File, Some(dir)) => {
            let store = FileStore::new(dir)
                .await
                .expect("failed to initialize storage");
            run(settings, model, store).await
        }
        _ => run(settings, model, InMemoryStore::default()).await,
    }
}

async fn run<S: VersionStore>(
    (api_settings, aggregation_settings, client_settings, server_settings): (
        ApiSettings,
        AggregationSettings,
        ClientSettings,
        ServerSettings,
    ),
    model: DenseModel,
    store: S,
) {
    let (aggregator, requests, _events) = AggregatorInitializer::new(
        aggregation_settings,
        client_settings,
        server_settings,
        Box::new(model),
        store,
    )
    .init()
    .await
    .expect("failed to initialize the aggregator");

    let sessions = Sessions::new(requests);

    tokio::select! {
        _ = aggregator.run() => {
            warn!("shutting down: aggregator terminated");
        }
        result = sessions.serve(api_settings) => {
            warn!("shutting down: server terminated: {:?}", result);
        }
        _ = signal::ctrl_c() => {}
    }
}
