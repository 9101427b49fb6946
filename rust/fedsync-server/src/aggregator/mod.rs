//! The aggregator owns the authoritative global model.
//!
//! It runs as a single task that consumes [`AggregatorRequest`]s. Sessions are registered by
//! `Connect` requests and immediately receive a [`Download`] of the current model. Uploads that
//! target the current version are collected until the configured quorum is reached; the collected
//! updates are then aggregated into a new version, which is persisted, published on the event bus
//! and broadcast to every session in registration order.
//!
//! Per version the aggregator cycles through two phases:
//!
//! ```text
//! Collecting -> Aggregating -> Collecting
//! ```
//!
//! [`AggregatorRequest`]: requests::AggregatorRequest

pub mod events;
pub mod requests;
mod version;


use std::{sync::Arc, time::Instant};

use derive_more::Display;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use self::version::VersionClock;
use self::{
    events::{EventPublisher, EventSubscriber, ModelUpdate},
    requests::{
        AggregatorRequest,
        ConnectRequest,
        DataRequest,
        DisconnectRequest,
        Outbox,
        RequestError,
        RequestReceiver,
        RequestSender,
        SessionId,
        UploadRequest,
    },
};
use crate::{
    settings::{AggregationSettings, ClientSettings, ServerSettings},
    storage::{StoreError, VersionStore},
};
use fedsync_core::{
    aggregation::{AggregationError, AggregationPolicy, Contribution},
    message::{Download, ServerMessage, Upload},
    model::{TrainableUnit, UnitError},
    tensor::{deserialize_all, serialize_all},
    ClientHyperparams,
    ClientId,
    CodecError,
    ModelVersion,
    SerializedWeight,
    Weight,
};

/// The name of the current phase.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PhaseName {
    #[display(fmt = "Collecting")]
    Collecting,
    #[display(fmt = "Aggregating")]
    Aggregating,
}

/// A registered client connection.
#[derive(Debug)]
struct Session {
    id: SessionId,
    client_id: ClientId,
    outbox: Outbox,
}

/// The aggregator. See the [module level documentation](self) for details.
pub struct Aggregator<S>
where
    S: VersionStore,
{
    phase: PhaseName,
    /// Connected sessions, in registration order.
    sessions: Vec<Session>,
    /// Accepted updates of the current version.
    pending: Vec<Upload>,
    unit: Box<dyn TrainableUnit>,
    weights: Vec<Weight>,
    version: ModelVersion,
    clock: VersionClock,
    hyperparams: ClientHyperparams,
    policy: AggregationPolicy,
    updates_per_version: usize,
    exit_on_last_disconnect: bool,
    data_received: u64,
    store: S,
    events: EventPublisher,
    requests: RequestReceiver,
}

impl<S> Aggregator<S>
where
    S: VersionStore,
{
    /// Handles requests until every [`RequestSender`] is dropped, or until the last client
    /// disconnects if the aggregator is configured to exit then.
    pub async fn run(mut self) {
        info!(
            "aggregator started with version {} and {} pending updates",
            self.version,
            self.pending.len()
        );
        // updates recovered from the store may already form a quorum
        if self.pending.len() >= self.updates_per_version {
            self.aggregate().await;
        }

        while let Some((req, span, resp_tx)) = self.requests.recv().await {
            let exit = matches!(req, AggregatorRequest::Disconnect(_));
            let resp = self.handle_request(req).instrument(span).await;
            // the session may be gone already
            let _ = resp_tx.send(resp);

            if exit && self.exit_on_last_disconnect && self.sessions.is_empty() {
                info!("last client disconnected, shutting down");
                break;
            }
        }
        self.requests.close();
        info!("aggregator stopped");
    }

    async fn handle_request(&mut self, req: AggregatorRequest) -> Result<(), RequestError> {
        match req {
            AggregatorRequest::Connect(req) => self.handle_connect(req),
            AggregatorRequest::Upload(req) => self.handle_upload(req).await,
            AggregatorRequest::Data(req) => self.handle_data(req),
            AggregatorRequest::Disconnect(req) => self.handle_disconnect(req),
        }
    }

    fn handle_connect(&mut self, req: ConnectRequest) -> Result<(), RequestError> {
        let ConnectRequest {
            session_id,
            client_id,
            outbox,
        } = req;
        if outbox.send(self.download().into()).is_err() {
            debug!("session {} closed before the initial download", session_id);
        }
        self.sessions.push(Session {
            id: session_id,
            client_id,
            outbox,
        });
        info!(
            "client {} connected as session {} ({} connected)",
            client_id,
            session_id,
            self.sessions.len()
        );
        self.events.broadcast_clients(self.sessions.len());
        Ok(())
    }

    fn handle_disconnect(&mut self, req: DisconnectRequest) -> Result<(), RequestError> {
        if let Some(index) = self.sessions.iter().position(|s| s.id == req.session_id) {
            let session = self.sessions.remove(index);
            info!(
                "client {} disconnected ({} connected)",
                session.client_id,
                self.sessions.len()
            );
            self.events.broadcast_clients(self.sessions.len());
        }
        Ok(())
    }

    fn handle_data(&mut self, req: DataRequest) -> Result<(), RequestError> {
        self.data_received += 1;
        debug!(
            "session {} sent {} examples of shape {:?} with labels of shape {:?} ({} data messages so far)",
            req.session_id,
            req.data.x.shape.first().copied().unwrap_or_default(),
            req.data.x.shape,
            req.data.y.shape,
            self.data_received,
        );
        Ok(())
    }

    async fn handle_upload(&mut self, req: UploadRequest) -> Result<(), RequestError> {
        let UploadRequest { session_id, upload } = req;
        if self.phase == PhaseName::Aggregating {
            warn!("dropping update of session {}: aggregation in progress", session_id);
            return Err(RequestError::AggregationInProgress);
        }
        if upload.version != self.version {
            info!(
                "dropping stale update of session {}: trained from {}, current version is {}",
                session_id, upload.version, self.version
            );
            return Err(RequestError::StaleVersionDropped(upload.version));
        }
        if let Err(err) = self.check_layout(&upload.weights) {
            warn!("dropping invalid update of session {}: {}", session_id, err);
            return Err(RequestError::InvalidUpdate(err));
        }

        self.store.add_update(&self.version, &upload).await?;
        debug!(
            "accepted update of client {} trained on {} examples",
            upload.client_id, upload.num_examples
        );
        if let Some(metrics) = &upload.metrics {
            debug!("client {} reported metrics {:?}", upload.client_id, metrics);
        }
        self.pending.push(upload);
        self.events.broadcast_pending(self.pending.len());

        if self.pending.len() >= self.updates_per_version {
            self.aggregate().await;
        }
        Ok(())
    }

    /// Checks that an update decodes and matches the layout of the global model.
    fn check_layout(&self, weights: &[SerializedWeight]) -> Result<(), String> {
        let decoded = deserialize_all(weights).map_err(|err| err.to_string())?;
        if decoded.len() != self.weights.len() {
            return Err(format!(
                "{} weights instead of {}",
                decoded.len(),
                self.weights.len()
            ));
        }
        for (position, (update, global)) in decoded.iter().zip(&self.weights).enumerate() {
            if update.dtype() != global.dtype() || update.shape() != global.shape() {
                return Err(format!(
                    "weight {} is {} {:?} instead of {} {:?}",
                    position,
                    update.dtype(),
                    update.shape(),
                    global.dtype(),
                    global.shape()
                ));
            }
        }
        Ok(())
    }

    /// Aggregates the pending updates into a new version. A failed aggregation discards the
    /// pending updates and keeps the current version.
    async fn aggregate(&mut self) {
        let span = info_span!("aggregation", version = %self.version, updates = self.pending.len());
        async {
            if let Err(err) = self.try_aggregate().await {
                error!("aggregation failed: {}", err);
                self.pending.clear();
                if let Err(err) = self.store.clear_updates(&self.version).await {
                    error!("failed to clear the pending updates: {}", err);
                }
                self.events.broadcast_pending(0);
                self.set_phase(PhaseName::Collecting);
            }
        }
        .instrument(span)
        .await
    }

    async fn try_aggregate(&mut self) -> Result<(), RequestError> {
        self.set_phase(PhaseName::Aggregating);
        let started = Instant::now();

        let contributions: Vec<Contribution> = self
            .pending
            .iter()
            .map(|update| Contribution {
                weights: update.weights.clone(),
                num_examples: update.num_examples,
            })
            .collect();
        let weights = self.policy.aggregate(&self.weights, &contributions)?;
        self.unit.set_weights(&weights)?;

        let version = self.clock.next_version();
        if let Err(err) = self.store.write_version(&version, &serialize_all(&weights)).await {
            // the unit keeps the weights of the current version
            let _ = self.unit.set_weights(&self.weights);
            return Err(err.into());
        }
        if let Some(locator) = self.store.model_locator(&version) {
            if let Err(err) = self.unit.save(&locator).await {
                warn!("failed to save the model of version {}: {}", version, err);
            }
        }
        // the new version is stored, so it has to be published even if the old updates linger
        if let Err(err) = self.store.clear_updates(&self.version).await {
            warn!(
                "failed to clear the updates of version {}: {}",
                self.version, err
            );
        }
        debug!(
            "aggregated {} updates in {:?}",
            self.pending.len(),
            started.elapsed()
        );

        info!("new version {} (previous {})", version, self.version);
        self.version = version;
        self.weights = weights;
        self.pending.clear();
        self.events.set_version(self.version.clone());
        self.set_phase(PhaseName::Collecting);
        self.events
            .broadcast_model(ModelUpdate(Arc::new(self.weights.clone())));
        self.events.broadcast_pending(0);
        self.broadcast_download();
        Ok(())
    }

    fn set_phase(&mut self, phase: PhaseName) {
        debug!("phase {} -> {}", self.phase, phase);
        self.phase = phase;
        self.events.broadcast_phase(phase);
    }

    fn download(&self) -> Download {
        Download {
            version: self.version.clone(),
            weights: serialize_all(&self.weights),
            hyperparams: self.hyperparams,
        }
    }

    /// Sends the current model to every session, in registration order.
    fn broadcast_download(&self) {
        let message = ServerMessage::from(self.download());
        for session in &self.sessions {
            if session.outbox.send(message.clone()).is_err() {
                debug!("session {} is closing, skipping broadcast", session.id);
            }
        }
        debug!(
            "broadcast version {} to {} sessions",
            self.version,
            self.sessions.len()
        );
    }
}

/// Errors which can occur during the initialization of the [`Aggregator`].
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("invalid aggregation settings: {0}")]
    Policy(#[from] AggregationError),
    #[error("version {0} is listed but its weights are unavailable")]
    GlobalModelUnavailable(ModelVersion),
    #[error("stored weights are invalid: {0}")]
    GlobalModelInvalid(#[from] CodecError),
    #[error("stored weights don't fit the model: {0}")]
    Unit(#[from] UnitError),
}

/// The initializer of the [`Aggregator`].
///
/// The aggregator resumes from the latest stored version together with its pending updates. If
/// the store is empty, the weights of the trainable unit become the first version.
pub struct AggregatorInitializer<S>
where
    S: VersionStore,
{
    aggregation_settings: AggregationSettings,
    client_settings: ClientSettings,
    server_settings: ServerSettings,
    unit: Box<dyn TrainableUnit>,
    store: S,
}

impl<S> AggregatorInitializer<S>
where
    S: VersionStore,
{
    /// Creates a new [`AggregatorInitializer`].
    pub fn new(
        aggregation_settings: AggregationSettings,
        client_settings: ClientSettings,
        server_settings: ServerSettings,
        unit: Box<dyn TrainableUnit>,
        store: S,
    ) -> Self {
        Self {
            aggregation_settings,
            client_settings,
            server_settings,
            unit,
            store,
        }
    }

    /// Initializes a new [`Aggregator`].
    ///
    /// # Errors
    /// Fails if the aggregation policy is unknown, if the store is unavailable or if the stored
    /// model doesn't fit the trainable unit.
    pub async fn init(
        self,
    ) -> Result<(Aggregator<S>, RequestSender, EventSubscriber), InitializationError> {
        let Self {
            aggregation_settings,
            client_settings,
            server_settings,
            mut unit,
            mut store,
        } = self;
        let policy = aggregation_settings.policy()?;
        store.is_ready().await?;

        let (version, weights, clock, pending) = match store.latest_version().await? {
            Some(version) => {
                let stored = store
                    .load_version(&version)
                    .await?
                    .ok_or_else(|| InitializationError::GlobalModelUnavailable(version.clone()))?;
                let weights = deserialize_all(&stored)?;
                unit.set_weights(&weights)?;
                let pending = store.pending_updates(&version).await?;
                info!(
                    "restored version {} with {} pending updates",
                    version,
                    pending.len()
                );
                (version.clone(), weights, VersionClock::resume(&version), pending)
            }
            None => {
                let mut clock = VersionClock::new();
                let version = clock.next_version();
                let weights = unit.get_weights();
                store.write_version(&version, &serialize_all(&weights)).await?;
                info!("no stored version, starting with version {}", version);
                (version, weights, clock, Vec::new())
            }
        };

        let (events, subscriber) = EventPublisher::init(
            version.clone(),
            PhaseName::Collecting,
            ModelUpdate(Arc::new(weights.clone())),
            pending.len(),
        );
        let (requests, sender) = RequestReceiver::new();
        let aggregator = Aggregator {
            phase: PhaseName::Collecting,
            sessions: Vec::new(),
            pending,
            unit,
            weights,
            version,
            clock,
            hyperparams: client_settings.into(),
            policy,
            updates_per_version: aggregation_settings.updates_per_version,
            exit_on_last_disconnect: server_settings.exit_on_last_disconnect,
            data_received: 0,
            store,
            events,
            requests,
        };
        Ok((aggregator, sender, subscriber))
    }
}
