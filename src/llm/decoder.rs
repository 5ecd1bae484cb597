//! Incremental decoding of the backend's `data: <json>` line stream.
//!
//! Transport chunks are buffered as raw bytes and split on `\n` before UTF-8
//! decoding, so a character split across two chunks survives. Lines without
//! the `data: ` prefix and lines whose JSON does not parse are skipped.

use super::{LlmError, StreamPayload};
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

const DATA_PREFIX: &str = "data: ";

/// Line splitter that keeps the unterminated tail between chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the payloads of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamPayload> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(payload) = decode_line(&self.buffer[start..end]) {
                payloads.push(payload);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        payloads
    }

    /// Decodes whatever is left once the transport has ended.
    pub fn finish(&mut self) -> Option<StreamPayload> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

/// Parses one line; `None` for anything that is not a well-formed data frame.
pub fn decode_line(line: &[u8]) -> Option<StreamPayload> {
    let line = std::str::from_utf8(line).ok()?.trim_end();
    let data = line.strip_prefix(DATA_PREFIX)?;
    match serde_json::from_str(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::trace!(error = %e, "skipping malformed frame");
            None
        }
    }
}

/// Lazy, single-consumer sequence of payloads over a byte transport.
pub struct PayloadStream {
    inner: BoxStream<'static, Result<Bytes, LlmError>>,
    decoder: FrameDecoder,
    pending: VecDeque<StreamPayload>,
    finished: bool,
}

impl PayloadStream {
    pub fn new<S>(inner: S) -> Self
    where
        S: Stream<Item = Result<Bytes, LlmError>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Stream over fixed chunks, delivered as fast as they are polled.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Result<Bytes, LlmError>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::new(stream::iter(chunks))
    }

    /// Takes the payloads already decoded but not yet yielded, without
    /// touching the transport.
    pub fn drain_buffered(&mut self) -> Vec<StreamPayload> {
        self.pending.drain(..).collect()
    }
}

impl Stream for PayloadStream {
    type Item = Result<StreamPayload, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(payload) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(payload)));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending.extend(this.decoder.feed(&chunk));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    this.pending.extend(this.decoder.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
