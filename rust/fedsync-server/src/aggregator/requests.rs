//! This module provides the `AggregatorRequest`, `RequestSender` and `RequestReceiver` types.

use derive_more::From;
use displaydoc::Display;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::Span;

use crate::storage::StoreError;
use fedsync_core::{
    aggregation::AggregationError,
    message::{Data, ServerMessage, Upload},
    model::UnitError,
    ClientId,
    ModelVersion,
};

/// Errors which can occur while the aggregator handles a request.
#[derive(Debug, Display, Error)]
pub enum RequestError {
    /// The update was trained from version {0}, which is not the current version.
    StaleVersionDropped(ModelVersion),
    /// The update was dropped because an aggregation is in progress.
    AggregationInProgress,
    /// Invalid update: {0}.
    InvalidUpdate(String),
    /// Aggregation failed: {0}.
    Aggregation(#[from] AggregationError),
    /// The aggregated weights were rejected by the model: {0}.
    Unit(#[from] UnitError),
    /// Storage request failed: {0}.
    Storage(#[from] StoreError),
    /// The request could not be processed due to an internal error: {0}.
    InternalError(&'static str),
}

/// Identifies one client connection. Sessions are numbered in the order they connect.
pub type SessionId = u64;

/// The channel the aggregator pushes messages to a session through.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// A new client connection.
#[derive(Debug)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    /// The client id announced in the handshake.
    pub client_id: ClientId,
    pub outbox: Outbox,
}

/// Weights uploaded by a session.
#[derive(Debug)]
pub struct UploadRequest {
    pub session_id: SessionId,
    pub upload: Upload,
}

/// Raw examples sent by a session.
#[derive(Debug)]
pub struct DataRequest {
    pub session_id: SessionId,
    pub data: Data,
}

/// A closed client connection.
#[derive(Debug)]
pub struct DisconnectRequest {
    pub session_id: SessionId,
}

/// An [`Aggregator`] request.
///
/// [`Aggregator`]: crate::aggregator::Aggregator
#[derive(Debug, From)]
pub enum AggregatorRequest {
    Connect(ConnectRequest),
    Upload(UploadRequest),
    Data(DataRequest),
    Disconnect(DisconnectRequest),
}

/// A handle to send requests to the [`Aggregator`].
///
/// [`Aggregator`]: crate::aggregator::Aggregator
#[derive(Clone, From, Debug)]
pub struct RequestSender(mpsc::UnboundedSender<(AggregatorRequest, Span, ResponseSender)>);

impl RequestSender {
    /// Sends a request to the [`Aggregator`] and waits for its response.
    ///
    /// # Errors
    /// Fails if the [`Aggregator`] has already shut down and the request channel has been closed
    /// as a result, or if the request itself failed.
    ///
    /// [`Aggregator`]: crate::aggregator::Aggregator
    pub async fn request(&self, req: AggregatorRequest, span: Span) -> Result<(), RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel::<Result<(), RequestError>>();
        self.0.send((req, span, resp_tx)).map_err(|_| {
            RequestError::InternalError(
                "failed to send request to the aggregator: aggregator is shutting down",
            )
        })?;
        resp_rx.await.map_err(|_| {
            RequestError::InternalError("failed to receive response from the aggregator")
        })?
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A channel for the aggregator to send the response to an [`AggregatorRequest`].
pub(in crate::aggregator) type ResponseSender = oneshot::Sender<Result<(), RequestError>>;

/// The receiver half of the request channel that is used by the [`Aggregator`] to receive
/// requests.
///
/// [`Aggregator`]: crate::aggregator::Aggregator
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(AggregatorRequest, Span, ResponseSender)>);

impl RequestReceiver {
    /// Creates a new request channel and returns the [`RequestReceiver`] as well as the
    /// [`RequestSender`] half.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<(AggregatorRequest, Span, ResponseSender)>();
        (RequestReceiver::from(rx), RequestSender::from(tx))
    }

    /// Closes the request channel. Requests sent afterwards fail immediately.
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next request.
    pub async fn recv(&mut self) -> Option<(AggregatorRequest, Span, ResponseSender)> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_answered() {
        let (mut receiver, sender) = RequestReceiver::new();
        let handle = tokio::spawn(async move {
            let req = DisconnectRequest { session_id: 3 };
            sender.request(req.into(), Span::none()).await
        });

        let (req, _span, resp_tx) = receiver.recv().await.unwrap();
        assert!(matches!(
            req,
            AggregatorRequest::Disconnect(DisconnectRequest { session_id: 3 })
        ));
        resp_tx
            .send(Err(RequestError::AggregationInProgress))
            .unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(RequestError::AggregationInProgress)
        ));
    }

    #[tokio::test]
    async fn test_closed_receiver_fails_requests() {
        let (mut receiver, sender) = RequestReceiver::new();
        receiver.close();
        assert!(sender.is_closed());
        let req = DisconnectRequest { session_id: 0 };
        assert!(matches!(
            sender.request(req.into(), Span::none()).await,
            Err(RequestError::InternalError(_))
        ));
    }
}
