//! axum WebSocket adapter for the connection seam.

use axum::extract::ws::{self, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use crate::connection::{CloseFrame, Inbound, MessageSink, MessageSource, TransportError};

pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into its read and write halves.
pub fn split(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource { inner: stream }, WsSink { inner: sink })
}

impl From<Message> for Inbound {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Binary(data) => Inbound::Binary(data),
            Message::Text(text) => Inbound::Text(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Ping(_) => Inbound::Ping,
            Message::Pong(_) => Inbound::Pong,
            Message::Close(frame) => Inbound::Close(frame.map(|f| CloseFrame {
                code: f.code,
                reason: f.reason.as_str().to_string(),
            })),
        }
    }
}

impl MessageSource for WsSource {
    async fn next_message(&mut self) -> Option<Result<Inbound, TransportError>> {
        let msg = self.inner.next().await?;
        Some(msg.map(Inbound::from).map_err(TransportError::from))
    }
}

impl MessageSink for WsSink {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.inner.send(Message::Binary(data)).await?;
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.inner.send(Message::Ping(Bytes::new())).await?;
        Ok(())
    }

    async fn send_close(&mut self, frame: CloseFrame) -> Result<(), TransportError> {
        let frame = ws::CloseFrame {
            code: frame.code,
            reason: frame.reason.into(),
        };
        self.inner.send(Message::Close(Some(frame))).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.close().await;
    }
}
