//! Streaming response handling for chat generation

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SinkClosed, TokenSink};
use crate::error::ChatError;

const STREAM_CAPACITY: usize = 256;

type StreamItem = Result<String, ChatError>;

/// Caller side of a generation: an ordered, single-pass token stream.
///
/// `cancel()` stops generation and nothing is persisted for the turn.
/// Dropping the stream only disconnects; generation finishes server side.
pub struct ResponseStream {
    receiver: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
}

impl ResponseStream {
    /// A connected stream/sink pair.
    pub fn channel() -> (Self, ChannelSink) {
        let (sender, receiver) = mpsc::channel(STREAM_CAPACITY);
        let cancel = CancellationToken::new();
        (
            Self {
                receiver,
                cancel: cancel.clone(),
            },
            ChannelSink {
                sender,
                cancel,
                disconnected: false,
            },
        )
    }

    /// User-initiated stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get next token
    pub async fn next_token(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Drain the stream, failing on the first error.
    pub async fn collect_text(mut self) -> Result<String, ChatError> {
        let mut result = String::new();
        while let Some(token) = self.next_token().await {
            result.push_str(&token?);
        }
        Ok(result)
    }
}

impl Stream for ResponseStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Producer side, owned by the generation task. Dropping it ends the stream.
pub struct ChannelSink {
    sender: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
    disconnected: bool,
}

impl ChannelSink {
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True once the caller dropped the stream.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected || self.sender.is_closed()
    }

    /// Deliver a terminal error and close the stream.
    pub async fn fail(self, error: ChatError) {
        // Nobody left to tell if the caller is gone
        let _ = self.sender.send(Err(error)).await;
    }
}

#[async_trait]
impl TokenSink for ChannelSink {
    async fn send_token(&mut self, token: &str) -> Result<(), SinkClosed> {
        if self.cancel.is_cancelled() {
            return Err(SinkClosed);
        }
        if self.disconnected {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SinkClosed),
            sent = self.sender.send(Ok(token.to_string())) => {
                if sent.is_err() {
                    tracing::debug!("Response stream dropped, finishing generation without a reader");
                    self.disconnected = true;
                }
                Ok(())
            }
        }
    }
}
