use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;

use parley_core::backend::{Framing, RawStream};
use parley_core::errors::BackendError;
use parley_core::stream::ModelDelta;

use crate::decoder::ModelStreamDecoder;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Decode a raw backend body into deltas. See [`ModelStream`].
pub fn decode(raw: RawStream, framing: Framing) -> ModelStream {
    ModelStream::new(raw, framing, DEFAULT_IDLE_TIMEOUT)
}

/// Wraps a raw byte stream and yields [`ModelDelta`]s.
///
/// Always ends with exactly one terminal delta, then `None`. If no bytes
/// arrive within the idle timeout the stream fails with
/// [`BackendError::StreamInterrupted`].
pub struct ModelStream {
    inner: RawStream,
    decoder: ModelStreamDecoder,
    pending: VecDeque<ModelDelta>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl ModelStream {
    pub fn new(raw: RawStream, framing: Framing, idle_timeout: Duration) -> Self {
        Self {
            inner: raw,
            decoder: ModelStreamDecoder::new(framing),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }
}

impl Stream for ModelStream {
    type Item = ModelDelta;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                if delta.is_terminal() {
                    self.done = true;
                }
                return Poll::Ready(Some(delta));
            }
            if self.done || self.decoder.is_finished() {
                self.done = true;
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);
                    let deltas = self.decoder.feed(&bytes);
                    self.pending.extend(deltas);
                }
                Poll::Ready(Some(Err(e))) => {
                    let deltas = self.decoder.fail(e);
                    self.pending.extend(deltas);
                }
                Poll::Ready(None) => {
                    let deltas = self.decoder.finish();
                    self.pending.extend(deltas);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let error = BackendError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        ));
                        let deltas = self.decoder.fail(error);
                        self.pending.extend(deltas);
                        continue;
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
