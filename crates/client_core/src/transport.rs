use std::pin::Pin;

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::error::TransportError;

/// One inbound item from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Text(String),
    Closed { code: Option<u16> },
}

pub type InboundStream = Pin<Box<dyn Stream<Item = Result<WireEvent, TransportError>> + Send>>;

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Write half and read half of one opened transport.
pub struct TransportLink {
    pub sink: Box<dyn FrameSink>,
    pub inbound: InboundStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

pub struct MissingConnector;

#[async_trait]
impl Connector for MissingConnector {
    async fn open(&self, _url: &Url) -> Result<TransportLink, TransportError> {
        Err(TransportError::Unavailable)
    }
}

/// Websocket transport over `tokio-tungstenite`.
pub struct WsConnector;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct WsSink {
    writer: WsWriter,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.writer
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.writer
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        let (writer, reader) = ws_stream.split();

        let inbound = reader
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(WireEvent::Text(text))),
                    Ok(Message::Close(frame)) => Some(Ok(WireEvent::Closed {
                        code: frame.map(|frame| u16::from(frame.code)),
                    })),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Receive(err.to_string()))),
                }
            })
            .boxed();

        Ok(TransportLink {
            sink: Box::new(WsSink { writer }),
            inbound,
        })
    }
}
