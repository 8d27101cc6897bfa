//! Deadline-based read/write halves over an upgraded WebSocket.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use crate::config::KeepaliveConfig;

/// Transport-level failure of a connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The peer sent a close frame or the stream ended.
    #[error("connection closed by peer (code {code:?})")]
    Closed { code: Option<u16> },

    /// Nothing (not even a pong) arrived within the read deadline.
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    /// A frame could not be flushed within the write deadline.
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("websocket error: {0}")]
    Transport(#[from] axum::Error),
}

impl ConnError {
    /// Whether this is an expected way for a connection to end, as opposed
    /// to a failure worth a warning.
    pub fn is_normal_close(&self) -> bool {
        match self {
            Self::Closed { code: None } => true,
            Self::Closed { code: Some(code) } => matches!(
                *code,
                close_code::NORMAL | close_code::AWAY | close_code::STATUS
            ),
            Self::ReadTimeout(_) => true,
            Self::WriteTimeout(_) | Self::Transport(_) => false,
        }
    }
}

/// Split an upgraded socket into its deadline-aware halves.
pub fn split(socket: WebSocket, keepalive: &KeepaliveConfig) -> (ConnReader, ConnWriter) {
    let (sink, stream) = socket.split();
    let reader = ConnReader {
        stream,
        pong_wait: keepalive.pong_wait,
        deadline: Instant::now() + keepalive.pong_wait,
    };
    let writer = ConnWriter {
        sink,
        write_wait: keepalive.write_wait,
    };
    (reader, writer)
}

/// Inbound half. Every successful read and every pong pushes the read
/// deadline `pong_wait` into the future.
pub struct ConnReader {
    stream: SplitStream<WebSocket>,
    pong_wait: Duration,
    deadline: Instant,
}

impl ConnReader {
    pub fn refresh_deadline(&mut self) {
        self.deadline = Instant::now() + self.pong_wait;
    }

    /// Wait for the next data frame (text or binary) and return its bytes.
    ///
    /// Control frames are consumed here: pings are answered by the
    /// WebSocket layer itself, pongs only refresh the deadline.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, ConnError> {
        loop {
            let next = tokio::time::timeout_at(self.deadline, self.stream.next())
                .await
                .map_err(|_| ConnError::ReadTimeout(self.pong_wait))?;

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ConnError::Transport(e)),
                None => return Err(ConnError::Closed { code: None }),
            };
            self.refresh_deadline();

            match frame {
                WsMessage::Text(text) => return Ok(text.as_str().as_bytes().to_vec()),
                WsMessage::Binary(data) => return Ok(data.to_vec()),
                WsMessage::Ping(_) => trace!("ping received"),
                WsMessage::Pong(_) => trace!("pong received"),
                WsMessage::Close(frame) => {
                    return Err(ConnError::Closed {
                        code: frame.map(|f| f.code),
                    });
                }
            }
        }
    }
}

/// Outbound half. Every write is bounded by `write_wait`.
pub struct ConnWriter {
    sink: SplitSink<WebSocket, WsMessage>,
    write_wait: Duration,
}

impl ConnWriter {
    pub async fn write_text(&mut self, text: String) -> Result<(), ConnError> {
        self.write(WsMessage::Text(text.into())).await
    }

    pub async fn write_ping(&mut self) -> Result<(), ConnError> {
        self.write(WsMessage::Ping(Default::default())).await
    }

    /// Send a normal-closure frame and flush the sink.
    pub async fn write_close(&mut self) -> Result<(), ConnError> {
        self.write(WsMessage::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        })))
        .await?;
        tokio::time::timeout(self.write_wait, self.sink.close())
            .await
            .map_err(|_| ConnError::WriteTimeout(self.write_wait))??;
        Ok(())
    }

    async fn write(&mut self, frame: WsMessage) -> Result<(), ConnError> {
        tokio::time::timeout(self.write_wait, self.sink.send(frame))
            .await
            .map_err(|_| ConnError::WriteTimeout(self.write_wait))??;
        Ok(())
    }
}
