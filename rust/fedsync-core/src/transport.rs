//! Typed message channels.
//!
//! A [`Channel`] is one end of a client connection: a sink for the outgoing
//! and a stream of the incoming messages. Over TCP every message is a bincode
//! frame behind a 4-byte big-endian length prefix. [`local_pair`] connects a
//! client and a server end in-process without any encoding.

use std::{io, marker::PhantomData, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures::{channel::mpsc, Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use crate::message::{ClientMessage, ServerMessage};

/// The default upper bound of a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame: {0}")]
    Codec(#[from] bincode::Error),
    #[error("the connection is closed")]
    Closed,
}

pub type BoxSink<T> = Pin<Box<dyn Sink<T, Error = TransportError> + Send>>;
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, TransportError>> + Send>>;

/// One end of a connection, sending `Out` and receiving `In`.
pub struct Channel<Out, In> {
    pub sink: BoxSink<Out>,
    pub stream: BoxStream<In>,
}

/// The client end of a connection.
pub type ClientChannel = Channel<ClientMessage, ServerMessage>;
/// The coordinator end of a connection.
pub type ServerChannel = Channel<ServerMessage, ClientMessage>;

impl<Out, In> Channel<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    /// Wraps a TCP stream into a framed message channel.
    pub fn tcp(stream: TcpStream, max_frame_length: usize) -> Self {
        let framed = Framed::new(stream, MessageCodec::<Out, In>::new(max_frame_length));
        let (sink, stream) = framed.split::<Out>();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Creates a connected pair of in-process channel ends.
pub fn local_pair() -> (ClientChannel, ServerChannel) {
    let (client_tx, server_rx) = mpsc::unbounded::<ClientMessage>();
    let (server_tx, client_rx) = mpsc::unbounded::<ServerMessage>();
    let client = Channel {
        sink: Box::pin(client_tx.sink_map_err(|_| TransportError::Closed)) as BoxSink<_>,
        stream: Box::pin(client_rx.map(Ok::<_, TransportError>)) as BoxStream<_>,
    };
    let server = Channel {
        sink: Box::pin(server_tx.sink_map_err(|_| TransportError::Closed)) as BoxSink<_>,
        stream: Box::pin(server_rx.map(Ok::<_, TransportError>)) as BoxStream<_>,
    };
    (client, server)
}

/// A length-delimited bincode codec encoding `Out` and decoding `In`.
pub struct MessageCodec<Out, In> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<Out, In> MessageCodec<Out, In> {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<Out: Serialize, In> Encoder<Out> for MessageCodec<Out, In> {
    type Error = TransportError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = bincode::serialize(&item)?;
        self.inner.encode(Bytes::from(frame), dst)?;
        Ok(())
    }
}

impl<Out, In: DeserializeOwned> Decoder for MessageCodec<Out, In> {
    type Item = In;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        common::{ClientHyperparams, ClientId, ModelVersion},
        message::{Download, Hello, Upload},
        tensor::{serialize_all, Weight},
    };

    fn download() -> ServerMessage {
        Download {
            version: ModelVersion::from(7),
            weights: serialize_all(&[Weight::from_f32(vec![2], vec![1., 2.]).unwrap()]),
            hyperparams: ClientHyperparams::default(),
        }
        .into()
    }

    #[test]
    fn test_codec_frames_are_length_prefixed() {
        let mut codec = MessageCodec::<ServerMessage, ServerMessage>::new(DEFAULT_MAX_FRAME_LENGTH);
        let mut buf = BytesMut::new();
        codec.encode(ServerMessage::Ack(3), &mut buf).unwrap();

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(body_len, buf.len() - 4);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ServerMessage::Ack(3)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_waits_for_a_complete_frame() {
        let mut codec = MessageCodec::<ServerMessage, ServerMessage>::new(DEFAULT_MAX_FRAME_LENGTH);
        let mut buf = BytesMut::new();
        codec.encode(download(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(download()));
    }

    #[test]
    fn test_codec_rejects_oversized_frames() {
        let mut codec = MessageCodec::<ServerMessage, ServerMessage>::new(16);
        let mut buf = BytesMut::new();
        assert!(codec.encode(download(), &mut buf).is_err());
    }

    #[tokio::test]
    async fn test_tcp_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = ServerChannel::tcp(stream, DEFAULT_MAX_FRAME_LENGTH);
            let hello = channel.stream.next().await.unwrap().unwrap();
            channel.sink.send(download()).await.unwrap();
            hello
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = ClientChannel::tcp(stream, DEFAULT_MAX_FRAME_LENGTH);
        let client_id = ClientId::generate();
        channel.sink.send(Hello { client_id }.into()).await.unwrap();

        assert_eq!(channel.stream.next().await.unwrap().unwrap(), download());
        assert_eq!(server.await.unwrap(), ClientMessage::from(Hello { client_id }));
    }

    #[tokio::test]
    async fn test_local_pair() {
        let (mut client, mut server) = local_pair();
        let upload = ClientMessage::from(Upload {
            seq: 1,
            version: ModelVersion::from(7),
            weights: Vec::new(),
            client_id: ClientId::generate(),
            num_examples: 5,
            metrics: None,
        });

        client.sink.send(upload.clone()).await.unwrap();
        assert_eq!(server.stream.next().await.unwrap().unwrap(), upload);

        server.sink.send(ServerMessage::Ack(1)).await.unwrap();
        assert_eq!(client.stream.next().await.unwrap().unwrap(), ServerMessage::Ack(1));

        drop(server);
        assert!(client.stream.next().await.is_none());
    }
}
