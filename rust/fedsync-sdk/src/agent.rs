//! The client agent.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use derive_more::Display;
use futures::{SinkExt, StreamExt};
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{connector::Connector, settings::AgentSettings};
use fedsync_core::{
    message::{ClientMessage, Data, Download, Hello, ServerMessage, Upload},
    model::{check_examples, FitConfig, TrainableUnit, UnitError},
    tensor::{deserialize_all, serialize, serialize_all},
    transport::{BoxSink, BoxStream, ClientChannel, TransportError},
    ClientHyperparams,
    ClientId,
    CodecError,
    ModelVersion,
    SerializedWeight,
    Weight,
};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no model received within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("message {0} was not acknowledged in time")]
    UploadTimeout(u64),
    #[error("the agent is not connected")]
    NotConnected,
    #[error("the connection is closed")]
    Disconnected,
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("trainable unit error: {0}")]
    Unit(#[from] UnitError),
    #[error("invalid tensor: {0}")]
    Codec(#[from] CodecError),
}

/// What the agent is currently doing.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    #[display(fmt = "Disconnected")]
    Disconnected,
    #[display(fmt = "Connecting")]
    Connecting,
    #[display(fmt = "Synced")]
    Synced,
    #[display(fmt = "Training")]
    Training,
    #[display(fmt = "Uploading")]
    Uploading,
}

/// A snapshot of the counters of an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStats {
    /// The version the agent last received.
    pub version: Option<ModelVersion>,
    /// Acknowledged uploads trained from the current version.
    pub uploads_this_version: u64,
    pub total_uploads: u64,
    /// Examples waiting for the next training iteration.
    pub buffered_examples: usize,
    /// The number of distinct versions received.
    pub versions_seen: u64,
}

/// The model the agent last received. Training always starts from it.
#[derive(Debug, Clone)]
struct Baseline {
    version: ModelVersion,
    weights: Vec<Weight>,
    hyperparams: ClientHyperparams,
}

/// Examples that haven't been trained on yet, concatenated along the leading dimension.
#[derive(Debug, Default)]
struct ExampleBuffer {
    x: Option<Weight>,
    y: Option<Weight>,
}

impl ExampleBuffer {
    fn len(&self) -> usize {
        self.x.as_ref().map(Weight::num_rows).unwrap_or_default()
    }

    fn push(&mut self, x: &Weight, y: &Weight) -> Result<(), CodecError> {
        let append = |buffered: &Option<Weight>, rows: &Weight| match buffered {
            Some(buffered) => Weight::concat_rows(&[buffered.clone(), rows.clone()]),
            None => Ok(rows.clone()),
        };
        let x = append(&self.x, x)?;
        let y = append(&self.y, y)?;
        self.x = Some(x);
        self.y = Some(y);
        Ok(())
    }

    /// Copies the first `n` examples.
    fn front(&self, n: usize) -> Result<(Weight, Weight), CodecError> {
        match (&self.x, &self.y) {
            (Some(x), Some(y)) => Ok((x.slice_rows(0, n)?, y.slice_rows(0, n)?)),
            _ => Err(CodecError::ShapeMismatch(format!(
                "{} examples requested from an empty buffer",
                n
            ))),
        }
    }

    /// Removes the first `n` examples.
    fn consume(&mut self, n: usize) -> Result<(), CodecError> {
        let len = self.len();
        if n >= len {
            self.x = None;
            self.y = None;
            return Ok(());
        }
        if let (Some(x), Some(y)) = (&self.x, &self.y) {
            let rest = (x.slice_rows(n, len)?, y.slice_rows(n, len)?);
            self.x = Some(rest.0);
            self.y = Some(rest.1);
        }
        Ok(())
    }
}

struct AgentState<U> {
    unit: U,
    baseline: Option<Baseline>,
    buffer: ExampleBuffer,
    uploads_this_version: u64,
    total_uploads: u64,
    versions_seen: u64,
}

impl<U> AgentState<U>
where
    U: TrainableUnit,
{
    /// Overwrites the baseline and the live weights of the unit with a downloaded model.
    fn apply(&mut self, download: Download) -> Result<(), AgentError> {
        let weights = deserialize_all(&download.weights)?;
        self.unit.set_weights(&weights)?;
        let is_new = self
            .baseline
            .as_ref()
            .map_or(true, |baseline| baseline.version != download.version);
        if is_new {
            self.uploads_this_version = 0;
            self.versions_seen += 1;
        }
        info!(
            "synced to version {} ({})",
            download.version, download.hyperparams
        );
        self.baseline = Some(Baseline {
            version: download.version,
            weights,
            hyperparams: download.hyperparams,
        });
        Ok(())
    }
}

/// The state shared between the agent and its connection tasks.
struct Shared<U> {
    state: Mutex<AgentState<U>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    phase: watch::Sender<AgentPhase>,
    version: watch::Sender<Option<ModelVersion>>,
}

impl<U> Shared<U>
where
    U: TrainableUnit,
{
    async fn apply(&self, download: Download) -> Result<(), AgentError> {
        let version = download.version.clone();
        self.state.lock().await.apply(download)?;
        self.version.send_replace(Some(version));
        Ok(())
    }

    /// Moves to `phase` unless the connection is already gone.
    fn transition(&self, phase: AgentPhase) {
        self.phase.send_if_modified(|current| {
            if *current == AgentPhase::Disconnected && phase != AgentPhase::Connecting {
                return false;
            }
            let modified = *current != phase;
            *current = phase;
            modified
        });
    }

    fn is_disconnected(&self) -> bool {
        *self.phase.borrow() == AgentPhase::Disconnected
    }

    async fn disconnected(&self) {
        self.phase.send_replace(AgentPhase::Disconnected);
        // pending acknowledgements fail with `Disconnected`
        self.acks.lock().await.clear();
    }
}

/// An open connection: the sender feeding the writer task and the reader task.
struct Connection {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Weights trained from a baseline, ready for upload.
struct TrainedUpdate {
    version: ModelVersion,
    weights: Vec<SerializedWeight>,
    num_examples: u64,
    metrics: Option<Vec<f32>>,
}

/// Keeps a trainable unit in sync with the coordinator.
///
/// The agent buffers the examples it is given. Every time `examples_per_update` examples are
/// buffered it trains the unit on them, uploads the trained weights tagged with the version they
/// were trained from and reverts the unit to that version. Models pushed by the coordinator
/// replace the local model at any time, but never in the middle of a training iteration.
pub struct ClientSyncAgent<U>
where
    U: TrainableUnit + 'static,
{
    client_id: ClientId,
    settings: AgentSettings,
    shared: Arc<Shared<U>>,
    connection: Option<Connection>,
    next_seq: AtomicU64,
}

impl<U> ClientSyncAgent<U>
where
    U: TrainableUnit + 'static,
{
    pub fn new(unit: U, client_id: ClientId, settings: AgentSettings) -> Self {
        let (phase, _) = watch::channel(AgentPhase::Disconnected);
        let (version, _) = watch::channel(None);
        let state = AgentState {
            unit,
            baseline: None,
            buffer: ExampleBuffer::default(),
            uploads_this_version: 0,
            total_uploads: 0,
            versions_seen: 0,
        };
        Self {
            client_id,
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                acks: Mutex::new(HashMap::new()),
                phase,
                version,
            }),
            connection: None,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Creates an agent with the client id stored at the configured identity path, or with a
    /// fresh client id if there is none.
    ///
    /// # Errors
    /// Fails if the identity file can't be read or written.
    pub async fn with_identity(unit: U, settings: AgentSettings) -> io::Result<Self> {
        let client_id = match &settings.identity_path {
            Some(path) => ClientId::load_or_generate(path).await?,
            None => ClientId::generate(),
        };
        Ok(Self::new(unit, client_id, settings))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Connects to the coordinator and waits for the current model.
    ///
    /// An existing connection is closed first. Once connected, every model the coordinator
    /// pushes replaces the local one.
    ///
    /// # Errors
    /// Fails with [`AgentError::ConnectionTimeout`] if no model arrives within the connection
    /// timeout, or if the connection can't be established.
    pub async fn connect<C>(&mut self, connector: &mut C) -> Result<(), AgentError>
    where
        C: Connector + ?Sized,
    {
        self.disconnect().await;
        self.shared.transition(AgentPhase::Connecting);
        let limit = self.settings.connection_timeout;
        let result = match timeout(limit, self.handshake(connector)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::ConnectionTimeout(limit)),
        };
        match result {
            Ok(connection) => {
                self.connection = Some(connection);
                self.shared.transition(AgentPhase::Synced);
                Ok(())
            }
            Err(err) => {
                warn!("failed to connect: {}", err);
                self.shared.disconnected().await;
                Err(err)
            }
        }
    }

    async fn handshake<C>(&self, connector: &mut C) -> Result<Connection, AgentError>
    where
        C: Connector + ?Sized,
    {
        let ClientChannel {
            mut sink,
            mut stream,
        } = connector.connect().await?;
        let hello = Hello {
            client_id: self.client_id,
        };
        sink.send(ClientMessage::from(hello)).await?;

        loop {
            match stream.next().await {
                Some(Ok(ServerMessage::Download(download))) => {
                    self.shared.apply(download).await?;
                    break;
                }
                Some(Ok(ServerMessage::Ack(seq))) => debug!("ignoring a stray ack {}", seq),
                Some(Err(err)) => return Err(err.into()),
                None => return Err(AgentError::Disconnected),
            }
        }

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, outgoing_rx));
        let (downloads, downloads_rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_loop(self.shared.clone(), downloads_rx));
        let reader = tokio::spawn(read_loop(self.shared.clone(), stream, downloads));
        Ok(Connection { outgoing, reader })
    }

    /// The open connection.
    ///
    /// # Errors
    /// Fails with [`AgentError::NotConnected`] if the agent never connected and with
    /// [`AgentError::Disconnected`] if the coordinator closed the connection.
    fn connection(&self) -> Result<&Connection, AgentError> {
        let connection = self.connection.as_ref().ok_or(AgentError::NotConnected)?;
        if self.shared.is_disconnected() {
            return Err(AgentError::Disconnected);
        }
        Ok(connection)
    }

    /// Closes the connection. Buffered examples are kept.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            drop(connection);
            info!("disconnected");
        }
        self.shared.disconnected().await;
    }

    /// Adds examples to the buffer and trains on the buffered examples as long as enough of them
    /// are available. Returns the number of acknowledged uploads.
    ///
    /// Every training iteration consumes exactly `examples_per_update` examples, even if it
    /// fails. Examples consumed by an upload that is not acknowledged are lost.
    ///
    /// # Errors
    /// Fails with [`AgentError::ShapeMismatch`] if the examples don't fit the unit, with
    /// [`AgentError::UploadTimeout`] if an upload isn't acknowledged in time or with the error of
    /// the unit if training fails. The unit is reverted to the last received model in any case.
    /// Once the coordinator has closed the connection it fails with [`AgentError::Disconnected`]
    /// and no further examples are consumed.
    pub async fn federated_update(&self, x: &Weight, y: &Weight) -> Result<usize, AgentError> {
        let connection = self.connection()?;
        {
            let mut state = self.shared.state.lock().await;
            check_examples(
                x,
                y,
                &state.unit.input_shape(),
                &state.unit.output_shape(),
            )
            .map_err(|err| match err {
                UnitError::ShapeMismatch(reason) => AgentError::ShapeMismatch(reason),
                err => err.into(),
            })?;
            state.buffer.push(x, y).map_err(|err| match err {
                CodecError::ShapeMismatch(reason) => AgentError::ShapeMismatch(reason),
                err => err.into(),
            })?;
            debug!("{} examples buffered", state.buffer.len());
        }

        let mut uploads = 0;
        loop {
            // examples stay buffered once the connection is lost
            if self.shared.is_disconnected() {
                return Err(AgentError::Disconnected);
            }
            match self.train_once().await? {
                Some(update) => self.upload(connection, update).await?,
                None => return Ok(uploads),
            }
            uploads += 1;
        }
    }

    /// Runs one training iteration if enough examples are buffered.
    async fn train_once(&self) -> Result<Option<TrainedUpdate>, AgentError> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let baseline = state.baseline.as_ref().ok_or(AgentError::NotConnected)?;
        let n = baseline.hyperparams.examples_per_update;
        if n == 0 || state.buffer.len() < n {
            return Ok(None);
        }

        self.shared.transition(AgentPhase::Training);
        let started = Instant::now();
        let trained = match state.buffer.front(n) {
            Ok((x, y)) => {
                train(
                    &mut state.unit,
                    &x,
                    &y,
                    &baseline.hyperparams,
                    self.settings.report_metrics,
                )
                .await
            }
            Err(err) => Err(err.into()),
        };
        let reverted = state.unit.set_weights(&baseline.weights);
        let consumed = state.buffer.consume(n);
        self.shared.transition(AgentPhase::Synced);
        debug!(
            "trained on {} examples in {:?}, {} left in the buffer",
            n,
            started.elapsed(),
            state.buffer.len()
        );

        let (weights, metrics) = trained?;
        reverted?;
        consumed?;
        Ok(Some(TrainedUpdate {
            version: baseline.version.clone(),
            weights,
            num_examples: n as u64,
            metrics,
        }))
    }

    async fn upload(
        &self,
        connection: &Connection,
        update: TrainedUpdate,
    ) -> Result<(), AgentError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let version = update.version.clone();
        let message = Upload {
            seq,
            version: update.version,
            weights: update.weights,
            client_id: self.client_id,
            num_examples: update.num_examples,
            metrics: update.metrics,
        };
        self.shared.transition(AgentPhase::Uploading);
        let started = Instant::now();
        let result = self.send_acknowledged(connection, seq, message.into()).await;
        self.shared.transition(AgentPhase::Synced);
        result?;

        debug!("upload {} acknowledged after {:?}", seq, started.elapsed());
        let mut state = self.shared.state.lock().await;
        state.total_uploads += 1;
        // a newer version may have arrived in the meantime
        if state.baseline.as_ref().map(|b| &b.version) == Some(&version) {
            state.uploads_this_version += 1;
        }
        Ok(())
    }

    /// Sends raw examples to the coordinator. They are logged there, but never aggregated.
    ///
    /// # Errors
    /// Fails with [`AgentError::UploadTimeout`] if the message isn't acknowledged in time.
    pub async fn upload_data(&self, x: &Weight, y: &Weight) -> Result<(), AgentError> {
        let connection = self.connection()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let data = Data {
            seq,
            x: serialize(x),
            y: serialize(y),
        };
        self.send_acknowledged(connection, seq, data.into()).await
    }

    async fn send_acknowledged(
        &self,
        connection: &Connection,
        seq: u64,
        message: ClientMessage,
    ) -> Result<(), AgentError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.acks.lock().await.insert(seq, ack_tx);
        // the reader may have cleared the acks before this one was inserted
        if self.shared.is_disconnected() || connection.outgoing.send(message).is_err() {
            self.shared.acks.lock().await.remove(&seq);
            return Err(AgentError::Disconnected);
        }
        match timeout(self.settings.upload_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AgentError::Disconnected),
            Err(_) => {
                self.shared.acks.lock().await.remove(&seq);
                warn!("message {} was not acknowledged in time", seq);
                Err(AgentError::UploadTimeout(seq))
            }
        }
    }

    /// Evaluates the local model.
    pub async fn evaluate(&self, x: &Weight, y: &Weight) -> Result<Vec<f32>, AgentError> {
        Ok(self.shared.state.lock().await.unit.evaluate(x, y)?)
    }

    pub async fn stats(&self) -> AgentStats {
        let state = self.shared.state.lock().await;
        AgentStats {
            version: state.baseline.as_ref().map(|b| b.version.clone()),
            uploads_this_version: state.uploads_this_version,
            total_uploads: state.total_uploads,
            buffered_examples: state.buffer.len(),
            versions_seen: state.versions_seen,
        }
    }

    /// The training parameters of the last received model.
    pub async fn hyperparams(&self) -> Option<ClientHyperparams> {
        let state = self.shared.state.lock().await;
        state.baseline.as_ref().map(|b| b.hyperparams)
    }

    /// The version of the last received model.
    pub fn version(&self) -> Option<ModelVersion> {
        self.shared.version.borrow().clone()
    }

    /// Watches the versions of the received models.
    pub fn version_listener(&self) -> watch::Receiver<Option<ModelVersion>> {
        self.shared.version.subscribe()
    }

    pub fn phase(&self) -> AgentPhase {
        *self.shared.phase.borrow()
    }

    pub fn phase_listener(&self) -> watch::Receiver<AgentPhase> {
        self.shared.phase.subscribe()
    }
}

/// Fits the unit and snapshots the trained weights, optionally with noise and metrics. The unit
/// is left trained.
async fn train<U>(
    unit: &mut U,
    x: &Weight,
    y: &Weight,
    hyperparams: &ClientHyperparams,
    report_metrics: bool,
) -> Result<(Vec<SerializedWeight>, Option<Vec<f32>>), AgentError>
where
    U: TrainableUnit,
{
    unit.fit(x, y, &FitConfig::from(hyperparams)).await?;
    let mut weights = unit.get_weights();
    add_noise(&mut weights, hyperparams.weight_noise_stddev);
    let metrics = if report_metrics {
        Some(unit.evaluate(x, y)?)
    } else {
        None
    };
    Ok((serialize_all(&weights), metrics))
}

/// Adds zero-mean Gaussian noise to the `float32` weights.
fn add_noise(weights: &mut [Weight], stddev: f32) {
    if stddev <= 0. {
        return;
    }
    let normal = match Normal::new(0., stddev) {
        Ok(normal) => normal,
        Err(err) => {
            warn!("not adding noise with standard deviation {}: {}", stddev, err);
            return;
        }
    };
    let mut rng = rand::thread_rng();
    for values in weights.iter_mut().filter_map(Weight::as_f32_mut) {
        values
            .iter_mut()
            .for_each(|value| *value += normal.sample(&mut rng));
    }
}

async fn write_loop(
    mut sink: BoxSink<ClientMessage>,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = outgoing.recv().await {
        if let Err(err) = sink.send(message).await {
            warn!("failed to send a message: {}", err);
            break;
        }
    }
    let _ = sink.close().await;
}

/// Applies downloaded models in the order they arrive. A model waits for a running training
/// iteration to finish.
async fn apply_loop<U>(shared: Arc<Shared<U>>, mut downloads: mpsc::UnboundedReceiver<Download>)
where
    U: TrainableUnit,
{
    while let Some(download) = downloads.recv().await {
        let version = download.version.clone();
        if let Err(err) = shared.apply(download).await {
            warn!("failed to apply version {}: {}", version, err);
        }
    }
}

/// Resolves acks and hands downloads over to the apply loop. Acks never wait for the state
/// lock.
async fn read_loop<U>(
    shared: Arc<Shared<U>>,
    mut stream: BoxStream<ServerMessage>,
    downloads: mpsc::UnboundedSender<Download>,
) where
    U: TrainableUnit,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(ServerMessage::Download(download)) => {
                if downloads.send(download).is_err() {
                    warn!("dropping a download: the apply loop is gone");
                }
            }
            Ok(ServerMessage::Ack(seq)) => match shared.acks.lock().await.remove(&seq) {
                Some(ack) => {
                    let _ = ack.send(());
                }
                None => debug!("ack {} arrived too late", seq),
            },
            Err(err) => {
                warn!("connection failed: {}", err);
                break;
            }
        }
    }
    info!("connection closed by the coordinator");
    shared.disconnected().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use mockall::{mock, predicate::always, Sequence};
    use tokio::sync::Notify;

    use super::*;
    use crate::connector::LocalConnector;
    use fedsync_core::{model::LossFnUnit, transport::local_pair, transport::ServerChannel};

    mock! {
        pub Unit {}

        #[async_trait]
        impl TrainableUnit for Unit {
            async fn fit(
                &mut self,
                x: &Weight,
                y: &Weight,
                config: &FitConfig,
            ) -> Result<(), UnitError>;
            fn get_weights(&self) -> Vec<Weight>;
            fn set_weights(&mut self, weights: &[Weight]) -> Result<(), UnitError>;
            fn evaluate(&self, x: &Weight, y: &Weight) -> Result<Vec<f32>, UnitError>;
            fn input_shape(&self) -> Vec<usize>;
            fn output_shape(&self) -> Vec<usize>;
        }
    }

    fn baseline() -> Vec<Weight> {
        vec![Weight::from_f32(vec![2], vec![1., 1.]).unwrap()]
    }

    fn trained() -> Vec<Weight> {
        vec![Weight::from_f32(vec![2], vec![3., 5.]).unwrap()]
    }

    fn examples(n: usize) -> (Weight, Weight) {
        let x = Weight::from_f32(vec![n, 1], (0..n).map(|i| i as f32).collect()).unwrap();
        let y = Weight::from_f32(vec![n, 1], vec![0.; n]).unwrap();
        (x, y)
    }

    fn hyperparams(examples_per_update: usize) -> ClientHyperparams {
        ClientHyperparams {
            examples_per_update,
            ..ClientHyperparams::default()
        }
    }

    fn download(version: u64, weights: &[Weight], examples_per_update: usize) -> ServerMessage {
        ServerMessage::Download(Download {
            version: ModelVersion::from(version),
            weights: serialize_all(weights),
            hyperparams: hyperparams(examples_per_update),
        })
    }

    /// A unit whose shapes are `[1] -> [1]` and that accepts any weights.
    fn mock_unit() -> MockUnit {
        let mut unit = MockUnit::new();
        unit.expect_input_shape().returning(|| vec![1]);
        unit.expect_output_shape().returning(|| vec![1]);
        unit
    }

    /// The coordinator end of a connection, driven by hand.
    struct FakeCoordinator {
        channel: ServerChannel,
    }

    impl FakeCoordinator {
        async fn handshake(&mut self, initial: ServerMessage) -> ClientId {
            let client_id = match self.channel.stream.next().await {
                Some(Ok(ClientMessage::Hello(hello))) => hello.client_id,
                msg => panic!("expected a hello, got {:?}", msg),
            };
            self.channel.sink.send(initial).await.unwrap();
            client_id
        }

        async fn next_upload(&mut self) -> Upload {
            match self.channel.stream.next().await {
                Some(Ok(ClientMessage::Upload(upload))) => upload,
                msg => panic!("expected an upload, got {:?}", msg),
            }
        }

        async fn ack(&mut self, seq: u64) {
            self.channel.sink.send(ServerMessage::Ack(seq)).await.unwrap();
        }
    }

    async fn connected<U: TrainableUnit + 'static>(
        unit: U,
        settings: AgentSettings,
        initial: ServerMessage,
    ) -> (ClientSyncAgent<U>, FakeCoordinator) {
        let (client, server) = local_pair();
        let mut client = Some(client);
        let mut connector = LocalConnector(move || client.take().unwrap());
        let mut agent = ClientSyncAgent::new(unit, ClientId::generate(), settings);
        let mut coordinator = FakeCoordinator { channel: server };

        let (connected, client_id) =
            tokio::join!(agent.connect(&mut connector), coordinator.handshake(initial));
        connected.unwrap();
        assert_eq!(client_id, agent.client_id());
        (agent, coordinator)
    }

    /// Runs `federated_update` while the coordinator acknowledges `uploads` uploads.
    async fn update_acked(
        agent: &ClientSyncAgent<impl TrainableUnit + 'static>,
        coordinator: &mut FakeCoordinator,
        (x, y): (Weight, Weight),
        uploads: usize,
    ) -> (Result<usize, AgentError>, Vec<Upload>) {
        let coordinator = async {
            let mut received = Vec::new();
            for _ in 0..uploads {
                let upload = coordinator.next_upload().await;
                coordinator.ack(upload.seq).await;
                received.push(upload);
            }
            received
        };
        tokio::join!(agent.federated_update(&x, &y), coordinator)
    }

    #[tokio::test]
    async fn test_connect_applies_the_initial_model() {
        let mut unit = mock_unit();
        unit.expect_set_weights()
            .withf(|weights| weights == baseline().as_slice())
            .times(1)
            .returning(|_| Ok(()));
        let (agent, _coordinator) =
            connected(unit, AgentSettings::default(), download(7, &baseline(), 3)).await;

        assert_eq!(agent.phase(), AgentPhase::Synced);
        assert_eq!(agent.version(), Some(ModelVersion::from(7)));
        assert_eq!(agent.hyperparams().await, Some(hyperparams(3)));
        let stats = agent.stats().await;
        assert_eq!(stats.versions_seen, 1);
        assert_eq!(stats.buffered_examples, 0);
    }

    #[tokio::test]
    async fn test_connection_timeout() {
        let settings = AgentSettings {
            connection_timeout: Duration::from_millis(50),
            ..AgentSettings::default()
        };
        let mut agent = ClientSyncAgent::new(mock_unit(), ClientId::generate(), settings);
        // the coordinator end stays open but never answers
        let (client, server) = local_pair();
        let mut client = Some(client);
        let mut connector = LocalConnector(move || client.take().unwrap());

        let result = agent.connect(&mut connector).await;
        assert!(matches!(result, Err(AgentError::ConnectionTimeout(_))));
        assert_eq!(agent.phase(), AgentPhase::Disconnected);
        drop(server);
    }

    #[tokio::test]
    async fn test_update_requires_a_connection() {
        let agent = ClientSyncAgent::new(mock_unit(), ClientId::generate(), AgentSettings::default());
        let (x, y) = examples(1);
        assert!(matches!(
            agent.federated_update(&x, &y).await,
            Err(AgentError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_buffer_accumulates_until_the_threshold() {
        let mut unit = mock_unit();
        let mut seq = Sequence::new();
        unit.expect_set_weights()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        unit.expect_fit()
            .withf(|x, y, config| {
                x.num_rows() == 5 && y.num_rows() == 5 && x.as_f32() == Some(&[0., 1., 2., 3., 4.][..]) && config.epochs == 5
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        unit.expect_get_weights()
            .times(1)
            .in_sequence(&mut seq)
            .returning(trained);
        unit.expect_set_weights()
            .withf(|weights| weights == baseline().as_slice())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (agent, mut coordinator) =
            connected(unit, AgentSettings::default(), download(1, &baseline(), 5)).await;

        // 3 examples: below the threshold, nothing is trained
        let (result, uploads) = update_acked(&agent, &mut coordinator, examples(3), 0).await;
        assert_eq!(result.unwrap(), 0);
        assert!(uploads.is_empty());
        assert_eq!(agent.stats().await.buffered_examples, 3);

        // 3 more: one iteration on exactly 5 examples, 1 left
        let (x, _) = examples(6);
        let rest = (
            x.slice_rows(3, 6).unwrap(),
            Weight::from_f32(vec![3, 1], vec![0.; 3]).unwrap(),
        );
        let (result, uploads) = update_acked(&agent, &mut coordinator, rest, 1).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].version, ModelVersion::from(1));
        assert_eq!(uploads[0].num_examples, 5);
        assert_eq!(uploads[0].weights, serialize_all(&trained()));
        assert_eq!(uploads[0].metrics, None);

        let stats = agent.stats().await;
        assert_eq!(stats.buffered_examples, 1);
        assert_eq!(stats.uploads_this_version, 1);
        assert_eq!(stats.total_uploads, 1);
        assert_eq!(agent.phase(), AgentPhase::Synced);
    }

    #[tokio::test]
    async fn test_failed_fit_still_reverts() {
        let mut unit = mock_unit();
        let mut seq = Sequence::new();
        unit.expect_set_weights()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        unit.expect_fit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(UnitError::ShapeMismatch("diverged".to_string())));
        unit.expect_set_weights()
            .withf(|weights| weights == baseline().as_slice())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        unit.expect_get_weights().never();

        let (agent, mut coordinator) =
            connected(unit, AgentSettings::default(), download(1, &baseline(), 2)).await;
        let (result, _) = update_acked(&agent, &mut coordinator, examples(2), 0).await;
        assert!(matches!(result, Err(AgentError::Unit(_))));

        let stats = agent.stats().await;
        assert_eq!(stats.buffered_examples, 0);
        assert_eq!(stats.total_uploads, 0);
        assert_eq!(agent.phase(), AgentPhase::Synced);
    }

    #[tokio::test]
    async fn test_shape_mismatch() {
        let mut unit = mock_unit();
        unit.expect_set_weights().returning(|_| Ok(()));
        unit.expect_fit().never();
        let (agent, _coordinator) =
            connected(unit, AgentSettings::default(), download(1, &baseline(), 1)).await;

        let x = Weight::from_f32(vec![2, 2], vec![0.; 4]).unwrap();
        let y = Weight::from_f32(vec![2, 1], vec![0.; 2]).unwrap();
        assert!(matches!(
            agent.federated_update(&x, &y).await,
            Err(AgentError::ShapeMismatch(_))
        ));

        let (x, _) = examples(3);
        let (_, y) = examples(2);
        assert!(matches!(
            agent.federated_update(&x, &y).await,
            Err(AgentError::ShapeMismatch(_))
        ));
        assert_eq!(agent.stats().await.buffered_examples, 0);
    }

    #[tokio::test]
    async fn test_upload_timeout_loses_the_examples() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut unit = mock_unit();
        let counter = calls.clone();
        unit.expect_set_weights()
            .withf(|weights| weights == baseline().as_slice())
            .returning(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        unit.expect_fit().times(1).returning(|_, _, _| Ok(()));
        unit.expect_get_weights().times(1).returning(trained);

        let settings = AgentSettings {
            upload_timeout: Duration::from_millis(50),
            ..AgentSettings::default()
        };
        let (agent, mut coordinator) = connected(unit, settings, download(1, &baseline(), 2)).await;

        let (x, y) = examples(3);
        let (result, upload) = tokio::join!(
            agent.federated_update(&x, &y),
            coordinator.next_upload()
        );
        assert!(matches!(result, Err(AgentError::UploadTimeout(seq)) if seq == upload.seq));
        // initial sync and revert
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = agent.stats().await;
        assert_eq!(stats.buffered_examples, 1);
        assert_eq!(stats.total_uploads, 0);

        // a late ack is ignored
        coordinator.ack(upload.seq).await;
        assert_eq!(agent.stats().await.total_uploads, 0);
    }

    #[tokio::test]
    async fn test_broadcast_replaces_the_baseline() {
        let unit = LossFnUnit::new(
            baseline(),
            vec![1],
            vec![1],
            |weights: &[Weight], _: &Weight, _: &Weight| {
                let gradient = Weight::from_f32(vec![2], vec![-1., -1.]).unwrap();
                Ok((0., vec![gradient; weights.len()]))
            },
        );
        let (mut agent, mut coordinator) =
            connected(unit, AgentSettings::default(), download(1, &baseline(), 1)).await;
        let mut versions = agent.version_listener();

        let (result, uploads) = update_acked(&agent, &mut coordinator, examples(1), 1).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(agent.stats().await.uploads_this_version, 1);
        let uploaded = deserialize_all(&uploads[0].weights).unwrap();
        assert!(uploaded[0].as_f32().unwrap().iter().all(|w| *w > 1.));

        let next = vec![Weight::from_f32(vec![2], vec![9., 9.]).unwrap()];
        coordinator.channel.sink.send(download(2, &next, 1)).await.unwrap();
        versions.changed().await.unwrap();
        assert_eq!(*versions.borrow(), Some(ModelVersion::from(2)));

        let stats = agent.stats().await;
        assert_eq!(stats.version, Some(ModelVersion::from(2)));
        assert_eq!(stats.uploads_this_version, 0);
        assert_eq!(stats.total_uploads, 1);
        assert_eq!(stats.versions_seen, 2);

        // training now starts from the new baseline and reverts to it
        let (result, uploads) = update_acked(&agent, &mut coordinator, examples(1), 1).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(uploads[0].version, ModelVersion::from(2));
        let local = agent.shared.state.lock().await.unit.get_weights();
        assert_eq!(local, next);

        agent.disconnect().await;
        assert_eq!(agent.phase(), AgentPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_metrics_and_noise() {
        let mut unit = mock_unit();
        unit.expect_set_weights().returning(|_| Ok(()));
        unit.expect_fit().returning(|_, _, _| Ok(()));
        unit.expect_get_weights().returning(trained);
        unit.expect_evaluate()
            .with(always(), always())
            .times(1)
            .returning(|_, _| Ok(vec![0.25]));

        let settings = AgentSettings {
            report_metrics: true,
            ..AgentSettings::default()
        };
        let initial = ServerMessage::Download(Download {
            version: ModelVersion::from(1),
            weights: serialize_all(&baseline()),
            hyperparams: ClientHyperparams {
                examples_per_update: 1,
                weight_noise_stddev: 0.5,
                ..ClientHyperparams::default()
            },
        });
        let (agent, mut coordinator) = connected(unit, settings, initial).await;

        let (result, uploads) = update_acked(&agent, &mut coordinator, examples(1), 1).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(uploads[0].metrics, Some(vec![0.25]));
        let uploaded = deserialize_all(&uploads[0].weights).unwrap();
        assert_eq!(uploaded[0].shape(), trained()[0].shape());
        assert_ne!(uploaded, trained());
    }

    #[tokio::test]
    async fn test_upload_data() {
        let mut unit = mock_unit();
        unit.expect_set_weights().returning(|_| Ok(()));
        let (agent, mut coordinator) =
            connected(unit, AgentSettings::default(), download(1, &baseline(), 1)).await;

        let (x, y) = examples(2);
        let coordinator = async {
            match coordinator.channel.stream.next().await {
                Some(Ok(ClientMessage::Data(data))) => {
                    coordinator.ack(data.seq).await;
                    data
                }
                msg => panic!("expected data, got {:?}", msg),
            }
        };
        let (result, data) = tokio::join!(agent.upload_data(&x, &y), coordinator);
        result.unwrap();
        assert_eq!(deserialize_all(&[data.x, data.y]).unwrap(), vec![x, y]);
    }

    #[tokio::test]
    async fn test_coordinator_going_away() {
        let mut unit = mock_unit();
        unit.expect_set_weights().returning(|_| Ok(()));
        unit.expect_fit().never();
        let (agent, coordinator) =
            connected(unit, AgentSettings::default(), download(1, &baseline(), 1)).await;
        let mut phase = agent.phase_listener();

        drop(coordinator);
        while *phase.borrow_and_update() != AgentPhase::Disconnected {
            phase.changed().await.unwrap();
        }
        assert_eq!(agent.phase(), AgentPhase::Disconnected);

        // fails right away instead of waiting for an ack, and keeps the examples untouched
        let (x, y) = examples(1);
        let result = timeout(Duration::from_secs(1), agent.federated_update(&x, &y))
            .await
            .unwrap();
        assert!(matches!(result, Err(AgentError::Disconnected)));
        assert_eq!(agent.stats().await.buffered_examples, 0);
        let result = timeout(Duration::from_secs(1), agent.upload_data(&x, &y))
            .await
            .unwrap();
        assert!(matches!(result, Err(AgentError::Disconnected)));
        assert!(agent.shared.acks.lock().await.is_empty());
    }

    /// A unit whose training only finishes once the gate is opened.
    struct GatedUnit {
        weights: Vec<Weight>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TrainableUnit for GatedUnit {
        async fn fit(&mut self, _: &Weight, _: &Weight, _: &FitConfig) -> Result<(), UnitError> {
            self.gate.notified().await;
            Ok(())
        }

        fn get_weights(&self) -> Vec<Weight> {
            self.weights.clone()
        }

        fn set_weights(&mut self, weights: &[Weight]) -> Result<(), UnitError> {
            self.weights = weights.to_vec();
            Ok(())
        }

        fn evaluate(&self, _: &Weight, _: &Weight) -> Result<Vec<f32>, UnitError> {
            Ok(vec![0.])
        }

        fn input_shape(&self) -> Vec<usize> {
            vec![1]
        }

        fn output_shape(&self) -> Vec<usize> {
            vec![1]
        }
    }

    #[tokio::test]
    async fn test_acks_are_not_held_up_by_training() {
        let gate = Arc::new(Notify::new());
        let unit = GatedUnit {
            weights: baseline(),
            gate: gate.clone(),
        };
        let settings = AgentSettings {
            upload_timeout: Duration::from_secs(1),
            ..AgentSettings::default()
        };
        let (agent, mut coordinator) = connected(unit, settings, download(1, &baseline(), 1)).await;
        let next = vec![Weight::from_f32(vec![2], vec![9., 9.]).unwrap()];
        let (x, y) = examples(1);

        let training = agent.federated_update(&x, &y);
        let meanwhile = async {
            // the training iteration holds the state until the gate opens; the new model queues
            // up behind it while the data ack must still get through
            coordinator
                .channel
                .sink
                .send(download(2, &next, 1))
                .await
                .unwrap();
            let acked = async {
                match coordinator.channel.stream.next().await {
                    Some(Ok(ClientMessage::Data(data))) => coordinator.ack(data.seq).await,
                    msg => panic!("expected data, got {:?}", msg),
                }
            };
            let (sent, _) = tokio::join!(agent.upload_data(&x, &y), acked);
            sent.unwrap();

            gate.notify_one();
            let upload = coordinator.next_upload().await;
            coordinator.ack(upload.seq).await;
            upload
        };
        let (result, upload) = tokio::join!(training, meanwhile);
        assert_eq!(result.unwrap(), 1);
        assert_eq!(upload.version, ModelVersion::from(1));

        let mut versions = agent.version_listener();
        while *versions.borrow_and_update() != Some(ModelVersion::from(2)) {
            versions.changed().await.unwrap();
        }
        assert_eq!(agent.shared.state.lock().await.unit.get_weights(), next);
        assert_eq!(agent.stats().await.total_uploads, 1);
    }

    #[tokio::test]
    async fn test_identity_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings {
            identity_path: Some(dir.path().join("client_id")),
            ..AgentSettings::default()
        };
        let first = ClientSyncAgent::with_identity(mock_unit(), settings.clone())
            .await
            .unwrap();
        let second = ClientSyncAgent::with_identity(mock_unit(), settings)
            .await
            .unwrap();
        assert_eq!(first.client_id(), second.client_id());
    }
}
