//! Client sessions.
//!
//! Every connection is served by a session task. The session waits for the client's
//! [`Hello`], registers itself with the aggregator and then forwards uploads and data to it.
//! Uploads and data are acknowledged as soon as they are received, before the aggregator decides
//! whether to keep them. A writer task drains the messages the aggregator pushes to the session
//! into the connection.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::{
    aggregator::requests::{
        AggregatorRequest,
        ConnectRequest,
        DataRequest,
        DisconnectRequest,
        RequestError,
        RequestSender,
        SessionId,
        UploadRequest,
    },
    settings::ApiSettings,
};
use fedsync_core::{
    message::{ClientMessage, Hello, ServerMessage},
    transport::{local_pair, Channel, ClientChannel, ServerChannel},
};

/// Accepts client connections and runs a session for each of them.
#[derive(Debug, Clone)]
pub struct Sessions {
    requests: RequestSender,
    next_id: Arc<AtomicU64>,
}

impl Sessions {
    pub fn new(requests: RequestSender) -> Self {
        Self {
            requests,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serves TCP clients on the configured address until the aggregator shuts down.
    ///
    /// # Errors
    /// Fails if the address can't be bound.
    pub async fn serve(self, settings: ApiSettings) -> io::Result<()> {
        let listener = TcpListener::bind(settings.bind_address).await?;
        info!("listening on {}", listener.local_addr()?);
        self.serve_listener(listener, settings.max_frame_length).await;
        Ok(())
    }

    /// Serves TCP clients on an already bound listener until the aggregator shuts down.
    pub async fn serve_listener(self, listener: TcpListener, max_frame_length: usize) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("failed to accept a connection: {}", err);
                    continue;
                }
            };
            if self.requests.is_closed() {
                debug!("aggregator is gone, no longer accepting connections");
                break;
            }
            debug!("accepted connection from {}", addr);
            if let Err(err) = configure(&stream) {
                warn!("failed to configure the connection from {}: {}", addr, err);
            }
            self.spawn(Channel::tcp(stream, max_frame_length));
        }
    }

    /// Opens an in-process connection and returns the client end.
    pub fn connect_local(&self) -> ClientChannel {
        let (client, server) = local_pair();
        self.spawn(server);
        client
    }

    /// Runs a session on the server end of a connection in a background task.
    pub fn spawn(&self, channel: ServerChannel) {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("session", id = session_id);
        tokio::spawn(run_session(session_id, channel, self.requests.clone()).instrument(span));
    }
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

async fn run_session(session_id: SessionId, channel: ServerChannel, requests: RequestSender) {
    let Channel {
        mut sink,
        mut stream,
    } = channel;

    let client_id = match stream.next().await {
        Some(Ok(ClientMessage::Hello(Hello { client_id }))) => client_id,
        Some(Ok(_)) => {
            warn!("closing session: the first message is not a hello");
            return;
        }
        Some(Err(err)) => {
            warn!("closing session: {}", err);
            return;
        }
        None => {
            debug!("connection closed before the handshake");
            return;
        }
    };

    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(
        async move {
            while let Some(message) = outbox_rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    debug!("failed to send a message: {}", err);
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    );

    let connect = ConnectRequest {
        session_id,
        client_id,
        outbox: outbox.clone(),
    };
    if let Err(err) = requests.request(connect.into(), Span::current()).await {
        warn!("failed to register the session: {}", err);
        writer.abort();
        return;
    }

    while let Some(message) = stream.next().await {
        let req: AggregatorRequest = match message {
            Ok(ClientMessage::Upload(upload)) => {
                let _ = outbox.send(ServerMessage::Ack(upload.seq));
                UploadRequest { session_id, upload }.into()
            }
            Ok(ClientMessage::Data(data)) => {
                let _ = outbox.send(ServerMessage::Ack(data.seq));
                DataRequest { session_id, data }.into()
            }
            Ok(ClientMessage::Hello(_)) => {
                debug!("ignoring a repeated hello");
                continue;
            }
            Err(err) => {
                warn!("closing session: {}", err);
                break;
            }
        };
        match requests.request(req, Span::current()).await {
            Ok(()) => {}
            Err(RequestError::InternalError(err)) => {
                warn!("closing session: {}", err);
                break;
            }
            // already logged by the aggregator, the client is never told
            Err(err) => debug!("request failed: {}", err),
        }
    }

    let disconnect = DisconnectRequest { session_id };
    let _ = requests.request(disconnect.into(), Span::current()).await;
    drop(outbox);
    // the writer ends once the aggregator has dropped its handle of the outbox
    let _ = writer.await;
    info!("session closed");
}
