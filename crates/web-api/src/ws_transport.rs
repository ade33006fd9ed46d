//! axum WebSocket 到实时核心传输抽象的适配

use application::{FrameSink, FrameSource, Inbound, Transport, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use domain::{CloseCode, ServerFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WsTransport {
    type Sink = WsSink;
    type Source = WsSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sender, receiver) = self.socket.split();
        (WsSink { sender }, WsSource { receiver })
    }
}

pub struct WsSink {
    sender: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let text = frame
            .to_json()
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        self.sender
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| TransportError::ConnectionGone)
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code: code.0,
            reason: reason.to_owned().into(),
        };
        let _ = self.sender.send(WsMessage::Close(Some(frame))).await;
        let _ = self.sender.close().await;
    }
}

pub struct WsSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn receive(&mut self) -> Option<Result<Inbound, TransportError>> {
        match self.receiver.next().await? {
            Ok(WsMessage::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => Some(Ok(Inbound::Heartbeat)),
            Ok(WsMessage::Binary(_)) => Some(Ok(Inbound::Unsupported)),
            Ok(WsMessage::Close(_)) => None,
            Err(err) => Some(Err(TransportError::Io(err.to_string()))),
        }
    }
}
