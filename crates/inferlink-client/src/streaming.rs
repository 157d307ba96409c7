//! Decoder for `text/event-stream` chat completion streams.
//!
//! The wire format is a sequence of `data: <json>` lines separated by blank
//! lines and terminated by `data: [DONE]`.  Decoding happens in three layers:
//!
//! - [`LineSplitter`] reassembles lines from arbitrary byte chunks.
//! - [`StreamDecoder`] is a line-at-a-time state machine
//!   (`Streaming -> Done | Failed`) that filters control lines, recognises
//!   the sentinel, skips malformed JSON with a diagnostic, and fails on an
//!   explicit `error` payload.
//! - [`ChunkStream`] owns the HTTP body and the pool lease, applies the
//!   per-chunk timeout, and yields typed [`ChatCompletionResponse`] records.
//!   Dropping it at any point closes the connection and returns the lease.
//!
//! A [`ChunkStream`] also keeps the most recent text in a bounded
//! [`ContentBuffer`] and reports progress to any attached
//! [`InferenceObserver`]s.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::time::Sleep;

use crate::error::{InferenceError, Result};
use crate::observer::InferenceObserver;
use crate::pool::PooledClient;
use crate::types::{ChatCompletionResponse, Usage};

/// Literal payload that ends a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Line decoder
// ---------------------------------------------------------------------------

/// Decoder state.  `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Streaming,
    Done,
    Failed,
}

/// Result of feeding one line to the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStep {
    /// Nothing to emit (blank, comment, control field, malformed JSON).
    Skip,
    /// A decoded JSON record.
    Record(Value),
    /// The sentinel was seen; the stream is over.
    Done,
}

/// Line-oriented state machine for one stream.
#[derive(Debug)]
pub struct StreamDecoder {
    state: DecoderState,
    malformed_lines: u64,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Streaming,
            malformed_lines: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state != DecoderState::Streaming
    }

    /// Lines skipped because their payload was not valid JSON.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }

    /// Move to the failed state from outside (e.g. a transport error).
    pub fn fail(&mut self) {
        self.state = DecoderState::Failed;
    }

    /// Feed a single line.
    pub fn feed_line(&mut self, line: &str) -> Result<DecodeStep> {
        match self.state {
            DecoderState::Streaming => {}
            DecoderState::Done => return Ok(DecodeStep::Done),
            DecoderState::Failed => {
                return Err(InferenceError::StreamProtocol {
                    reason: "stream already failed".into(),
                });
            }
        }

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(':') {
            return Ok(DecodeStep::Skip);
        }

        let payload = match line.strip_prefix("data:") {
            Some(data) => data.trim_start(),
            None if is_sse_field(line) => return Ok(DecodeStep::Skip),
            None => line,
        };
        if payload.is_empty() {
            return Ok(DecodeStep::Skip);
        }

        if payload == DONE_SENTINEL {
            self.state = DecoderState::Done;
            return Ok(DecodeStep::Done);
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                self.malformed_lines += 1;
                tracing::warn!(line = payload, error = %e, "skipping malformed stream chunk");
                return Ok(DecodeStep::Skip);
            }
        };

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            self.state = DecoderState::Failed;
            return Err(InferenceError::StreamProtocol {
                reason: format!("server reported error: {}", error_message(error)),
            });
        }

        Ok(DecodeStep::Record(value))
    }
}

/// SSE fields other than `data` carry nothing for us.
fn is_sse_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_owned),
    }
}

/// Decode any source of lines into a lazy stream of JSON records.
///
/// The stream ends at the sentinel or at the end of input, and after the
/// first error.
pub fn decode_lines<S>(lines: S) -> impl Stream<Item = Result<Value>>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    stream::unfold(
        (lines, StreamDecoder::new()),
        |(mut lines, mut decoder)| async move {
            if decoder.is_terminal() {
                return None;
            }
            loop {
                let line = match lines.next().await {
                    Some(Ok(line)) => line,
                    Some(Err(err)) => {
                        decoder.fail();
                        return Some((Err(err), (lines, decoder)));
                    }
                    None => return None,
                };
                match decoder.feed_line(&line) {
                    Ok(DecodeStep::Skip) => continue,
                    Ok(DecodeStep::Done) => return None,
                    Ok(DecodeStep::Record(value)) => return Some((Ok(value), (lines, decoder))),
                    Err(err) => return Some((Err(err), (lines, decoder))),
                }
            }
        },
    )
}

// ---------------------------------------------------------------------------
// Line splitter
// ---------------------------------------------------------------------------

/// Longest line the splitter buffers before it gives up on the stream.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Reassembles `\n`-terminated lines from byte chunks.  Multi-byte UTF-8
/// sequences split across chunks are handled because splitting happens on
/// bytes.  A line that is not valid UTF-8 is dropped with a warning and
/// counted, and the lines around it are unaffected.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    invalid_lines: u64,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            invalid_lines: 0,
        }
    }

    /// Lines dropped because they were not valid UTF-8.
    pub fn invalid_lines(&self) -> u64 {
        self.invalid_lines
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Fails with [`InferenceError::StreamProtocol`] once a line grows past
    /// the configured maximum.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            if end - start > self.max_line {
                return Err(self.line_too_long());
            }
            let line = &self.buf[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            match decode_line(line) {
                Some(line) => lines.push(line),
                None => self.invalid_lines += 1,
            }
            start = end + 1;
            self.scanned = start;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(self.line_too_long());
        }
        Ok(lines)
    }

    /// Return the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buf);
        let decoded = decode_line(&tail);
        if decoded.is_none() {
            self.invalid_lines += 1;
        }
        decoded
    }

    fn line_too_long(&mut self) -> InferenceError {
        self.buf.clear();
        self.scanned = 0;
        InferenceError::StreamProtocol {
            reason: format!("stream line exceeds {} bytes", self.max_line),
        }
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(line) => Some(line.to_owned()),
        Err(e) => {
            tracing::warn!(
                len = bytes.len(),
                error = %e,
                "skipping stream line with invalid UTF-8"
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters for one stream.
#[derive(Debug, Clone)]
pub struct StreamStats {
    started: Instant,
    finished: Option<Instant>,
    /// Network chunks read from the body.
    pub chunks_received: u64,
    /// Typed records yielded to the consumer.
    pub records: u64,
    /// Records that carried non-empty content.
    pub content_deltas: u64,
    pub malformed_lines: u64,
    pub errors: u64,
    /// Attempts spent opening the stream before it succeeded.
    pub retries: u32,
    /// Usage reported by the server, if it sent any.
    pub usage: Option<Usage>,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            finished: None,
            chunks_received: 0,
            records: 0,
            content_deltas: 0,
            malformed_lines: 0,
            errors: 0,
            retries: 0,
            usage: None,
        }
    }
}

impl StreamStats {
    /// Time between creation and the terminal state.
    pub fn duration(&self) -> Option<Duration> {
        self.finished.map(|end| end.duration_since(self.started))
    }

    /// Completion tokens per second, from reported usage when available and
    /// from the number of content deltas otherwise.
    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.duration()?.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let tokens = self
            .usage
            .map_or(self.content_deltas, |u| u64::from(u.completion_tokens));
        Some(tokens as f64 / secs)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    fn record(&mut self, chunk: &ChatCompletionResponse) {
        self.records += 1;
        if chunk.first_text().is_some_and(|t| !t.is_empty()) {
            self.content_deltas += 1;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }
}

// ---------------------------------------------------------------------------
// Content buffer
// ---------------------------------------------------------------------------

/// Default capacity of a stream's [`ContentBuffer`], in bytes.
pub const DEFAULT_BUFFER_BYTES: usize = 1024;

/// The most recent text of a stream, capped at a fixed number of bytes.
///
/// Older text is discarded first.  The cap is kept on a character boundary,
/// so the buffer may hold slightly less than its capacity.
#[derive(Debug, Clone)]
pub struct ContentBuffer {
    pieces: VecDeque<String>,
    bytes: usize,
    capacity: usize,
}

impl Default for ContentBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_BYTES)
    }
}

impl ContentBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pieces: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    pub fn push(&mut self, text: &str) {
        if text.is_empty() || self.capacity == 0 {
            return;
        }
        self.pieces.push_back(text.to_owned());
        self.bytes += text.len();

        while self.bytes > self.capacity {
            if self.pieces.len() > 1 {
                if let Some(old) = self.pieces.pop_front() {
                    self.bytes -= old.len();
                }
                continue;
            }
            let excess = self.bytes - self.capacity;
            if let Some(piece) = self.pieces.front_mut() {
                let cut = (excess..=piece.len())
                    .find(|&i| piece.is_char_boundary(i))
                    .unwrap_or(piece.len());
                piece.drain(..cut);
                self.bytes = piece.len();
            }
            break;
        }
    }

    /// Everything currently buffered, oldest first.
    pub fn content(&self) -> String {
        self.pieces.iter().map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.pieces.clear();
        self.bytes = 0;
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Typed chunk stream
// ---------------------------------------------------------------------------

/// A lazily decoded completion stream that owns its connection.
///
/// Yields records until the sentinel, the end of the body, or the first
/// error.  After that it only yields `None`.  The body and the pool lease
/// are released as soon as the stream reaches a terminal state, and in any
/// case when it is dropped.
///
/// Attached observers see every record, the error that ended the stream (if
/// any) and the final stats.  A stream dropped early still reports
/// completion.
pub struct ChunkStream {
    id: Option<String>,
    body: BoxStream<'static, Result<Vec<u8>>>,
    splitter: LineSplitter,
    pending: VecDeque<String>,
    decoder: StreamDecoder,
    chunk_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    body_done: bool,
    finished: bool,
    stats: StreamStats,
    buffer: ContentBuffer,
    observers: Vec<Arc<dyn InferenceObserver>>,
    lease: Option<PooledClient>,
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("id", &self.id)
            .field("state", &self.decoder.state())
            .field("finished", &self.finished)
            .field("stats", &self.stats)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl ChunkStream {
    /// Wrap an arbitrary byte stream.  Must be called inside a Tokio runtime.
    pub fn new<S>(body: S, chunk_timeout: Duration, lease: Option<PooledClient>) -> Self
    where
        S: Stream<Item = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            id: None,
            body: body.boxed(),
            splitter: LineSplitter::new(),
            pending: VecDeque::new(),
            decoder: StreamDecoder::new(),
            chunk_timeout,
            deadline: Box::pin(tokio::time::sleep(chunk_timeout)),
            body_done: false,
            finished: false,
            stats: StreamStats::default(),
            buffer: ContentBuffer::default(),
            observers: Vec::new(),
            lease,
        }
    }

    /// Wrap the body of an HTTP response, holding `lease` until the stream
    /// ends or is dropped.
    pub fn from_response(
        resp: reqwest::Response,
        chunk_timeout: Duration,
        lease: Option<PooledClient>,
    ) -> Self {
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(Vec::from).map_err(InferenceError::from));
        Self::new(body, chunk_timeout, lease)
    }

    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer = ContentBuffer::new(bytes);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn InferenceObserver>) -> Self {
        self.add_observer(observer);
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn InferenceObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn set_retries(&mut self, retries: u32) {
        self.stats.retries = retries;
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Registry id, once the stream has been registered.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The most recent text deltas, up to the buffer capacity.
    pub fn buffered_text(&self) -> String {
        self.buffer.content()
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn state(&self) -> DecoderState {
        self.decoder.state()
    }

    /// Whether the stream still holds its connection and pool lease.
    pub fn holds_connection(&self) -> bool {
        !self.finished
    }

    /// Adapt into a stream of non-empty text deltas from the first choice.
    pub fn into_text(self) -> impl Stream<Item = Result<String>> + Send {
        self.filter_map(|item| async move {
            match item {
                Ok(chunk) => chunk
                    .first_text()
                    .filter(|t| !t.is_empty())
                    .map(|t| Ok(t.to_owned())),
                Err(err) => Some(Err(err)),
            }
        })
    }

    /// Enter a terminal state and release the connection and lease.
    fn close(&mut self, failed: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if failed {
            self.decoder.fail();
            self.stats.errors += 1;
        }
        self.stats.malformed_lines =
            self.decoder.malformed_lines() + self.splitter.invalid_lines();
        self.stats.finished = Some(Instant::now());
        self.body = stream::empty().boxed();
        self.pending.clear();
        self.lease = None;

        tracing::info!(
            id = self.id.as_deref().unwrap_or("-"),
            records = self.stats.records,
            chunks = self.stats.chunks_received,
            malformed = self.stats.malformed_lines,
            retries = self.stats.retries,
            failed,
            duration = ?self.stats.duration(),
            "completion stream finished"
        );
        for observer in &self.observers {
            observer.on_complete(&self.stats);
        }
    }

    fn fail_with(&mut self, err: InferenceError) -> Poll<Option<Result<ChatCompletionResponse>>> {
        tracing::warn!(error = %err, "completion stream failed");
        for observer in &self.observers {
            observer.on_error(&err);
        }
        self.close(true);
        Poll::Ready(Some(Err(err)))
    }

    fn deliver(
        &mut self,
        chunk: ChatCompletionResponse,
    ) -> Poll<Option<Result<ChatCompletionResponse>>> {
        self.stats.record(&chunk);
        if let Some(text) = chunk.first_text() {
            self.buffer.push(text);
        }
        for observer in &self.observers {
            observer.on_chunk(&chunk);
        }
        Poll::Ready(Some(Ok(chunk)))
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("completion stream dropped before the end");
            self.close(false);
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<ChatCompletionResponse>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            while let Some(line) = this.pending.pop_front() {
                match this.decoder.feed_line(&line) {
                    Ok(DecodeStep::Skip) => {}
                    Ok(DecodeStep::Done) => {
                        this.close(false);
                        return Poll::Ready(None);
                    }
                    Ok(DecodeStep::Record(value)) => {
                        return match ChatCompletionResponse::from_chunk_value(value) {
                            Ok(chunk) => this.deliver(chunk),
                            Err(err) => this.fail_with(err),
                        };
                    }
                    Err(err) => return this.fail_with(err),
                }
            }

            if this.body_done {
                match this.splitter.finish() {
                    Some(tail) => {
                        this.pending.push_back(tail);
                        continue;
                    }
                    None => {
                        tracing::debug!("stream body ended without sentinel");
                        this.close(false);
                        return Poll::Ready(None);
                    }
                }
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.stats.chunks_received += 1;
                    let next = tokio::time::Instant::now() + this.chunk_timeout;
                    this.deadline.as_mut().reset(next);
                    match this.splitter.push(&bytes) {
                        Ok(lines) => this.pending.extend(lines),
                        Err(err) => return this.fail_with(err),
                    }
                }
                Poll::Ready(Some(Err(err))) => return this.fail_with(err),
                Poll::Ready(None) => this.body_done = true,
                Poll::Pending => {
                    if this.deadline.as_mut().poll(cx).is_ready() {
                        let err = InferenceError::Timeout {
                            reason: format!("no stream data within {:?}", this.chunk_timeout),
                        };
                        return this.fail_with(err);
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use serde_json::json;

    use super::*;

    fn lines(items: &[&str]) -> impl Stream<Item = Result<String>> + Unpin {
        stream::iter(
            items
                .iter()
                .map(|s| Ok((*s).to_owned()))
                .collect::<Vec<_>>(),
        )
    }

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        stream::iter(
            chunks
                .iter()
                .map(|c| Ok(c.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    fn chunk_line(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({
                "id": "cmpl-1",
                "object": "chat.completion.chunk",
                "created": 1,
                "model": "qwen",
                "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
            })
        )
    }

    #[test]
    fn decoder_skips_blank_and_comment_lines() {
        let mut d = StreamDecoder::new();
        assert_eq!(d.feed_line("").unwrap(), DecodeStep::Skip);
        assert_eq!(d.feed_line("   ").unwrap(), DecodeStep::Skip);
        assert_eq!(d.feed_line("# note").unwrap(), DecodeStep::Skip);
        assert_eq!(d.feed_line(": keepalive").unwrap(), DecodeStep::Skip);
        assert_eq!(d.feed_line("event: message").unwrap(), DecodeStep::Skip);
        assert_eq!(d.state(), DecoderState::Streaming);
    }

    #[test]
    fn decoder_strips_data_prefix() {
        let mut d = StreamDecoder::new();
        assert_eq!(
            d.feed_line("data: {\"a\":1}").unwrap(),
            DecodeStep::Record(json!({"a": 1}))
        );
        assert_eq!(
            d.feed_line("data:{\"b\":2}").unwrap(),
            DecodeStep::Record(json!({"b": 2}))
        );
        assert_eq!(d.feed_line("data: [DONE]").unwrap(), DecodeStep::Done);
    }

    #[test]
    fn decoder_done_is_terminal() {
        let mut d = StreamDecoder::new();
        assert_eq!(d.feed_line("  [DONE]  ").unwrap(), DecodeStep::Done);
        assert!(d.is_terminal());
        assert_eq!(d.feed_line("{\"a\":1}").unwrap(), DecodeStep::Done);
    }

    #[test]
    fn decoder_error_payload_fails_stream() {
        let mut d = StreamDecoder::new();
        let err = d
            .feed_line(r#"{"error": {"message": "x"}}"#)
            .unwrap_err();
        match err {
            InferenceError::StreamProtocol { reason } => assert!(reason.ends_with(": x")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(d.state(), DecoderState::Failed);
        assert!(d.feed_line("{\"a\":1}").is_err());
    }

    #[test]
    fn decoder_null_error_field_is_data() {
        let mut d = StreamDecoder::new();
        assert!(matches!(
            d.feed_line(r#"{"error": null, "a": 1}"#).unwrap(),
            DecodeStep::Record(_)
        ));
    }

    #[tokio::test]
    async fn decode_lines_skips_malformed_and_stops_at_sentinel() {
        let input = ["{\"a\":1}", "not json", "{\"b\":2}", "[DONE]", "{\"c\":3}"];
        let records: Vec<Value> = decode_lines(lines(&input)).try_collect().await.unwrap();
        assert_eq!(records, vec![json!({"a": 1}), json!({"b": 2})]);

        let mut d = StreamDecoder::new();
        for line in &input[..4] {
            d.feed_line(line).unwrap();
        }
        assert_eq!(d.malformed_lines(), 1);
    }

    #[tokio::test]
    async fn decode_lines_error_yields_nothing_further() {
        let input = [r#"{"error": {"message": "x"}}"#, "{\"a\":1}"];
        let items: Vec<Result<Value>> = decode_lines(lines(&input)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(InferenceError::StreamProtocol { .. })));
    }

    #[test]
    fn splitter_handles_split_lines_and_utf8() {
        let mut s = LineSplitter::new();
        let text = "data: é\r\nnext";
        let bytes = text.as_bytes();
        // Split inside the two-byte `é`.
        let cut = text.find('é').unwrap() + 1;
        assert!(s.push(&bytes[..cut]).unwrap().is_empty());
        assert_eq!(s.push(&bytes[cut..]).unwrap(), vec!["data: é".to_owned()]);
        assert_eq!(s.finish(), Some("next".to_owned()));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn splitter_drops_invalid_utf8_line_only() {
        let mut s = LineSplitter::new();
        let mut chunk = b"one\n".to_vec();
        chunk.extend_from_slice(&[b'x', 0xff, 0xfe, b'\n']);
        chunk.extend_from_slice(b"two\n");
        assert_eq!(s.push(&chunk).unwrap(), vec!["one".to_owned(), "two".to_owned()]);
        assert_eq!(s.invalid_lines(), 1);

        assert!(s.push(&[0xc3]).unwrap().is_empty());
        assert_eq!(s.finish(), None);
        assert_eq!(s.invalid_lines(), 2);
    }

    #[test]
    fn splitter_returns_every_line_of_a_large_chunk() {
        let mut s = LineSplitter::new();
        let text: String = (0..1000).map(|i| format!("line {i}\n")).collect();
        let lines = s.push(text.as_bytes()).unwrap();
        assert_eq!(lines.len(), 1000);
        assert_eq!(lines[999], "line 999");

        // A partial line keeps accumulating across pushes.
        assert!(s.push(b"par").unwrap().is_empty());
        assert!(s.push(b"tial").unwrap().is_empty());
        assert_eq!(s.push(b"\r\n").unwrap(), vec!["partial".to_owned()]);
    }

    #[test]
    fn splitter_rejects_overlong_lines() {
        let mut s = LineSplitter::with_max_line(8);
        assert_eq!(s.push(b"12345678\n").unwrap(), vec!["12345678".to_owned()]);
        assert!(s.push(b"12345").unwrap().is_empty());
        assert!(matches!(
            s.push(b"6789"),
            Err(InferenceError::StreamProtocol { .. })
        ));

        let mut s = LineSplitter::with_max_line(8);
        assert!(matches!(
            s.push(b"0123456789\nok\n"),
            Err(InferenceError::StreamProtocol { .. })
        ));
    }

    #[test]
    fn content_buffer_keeps_most_recent_text() {
        let mut buf = ContentBuffer::new(8);
        buf.push("abc");
        buf.push("def");
        assert_eq!(buf.content(), "abcdef");
        buf.push("ghi");
        assert_eq!(buf.content(), "defghi");
        assert_eq!(buf.len(), 6);

        buf.push("0123456789");
        assert_eq!(buf.content(), "23456789");

        // Trimming never splits a character.
        let mut buf = ContentBuffer::new(3);
        buf.push("aé€");
        assert_eq!(buf.content(), "€");

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.content(), "");
    }

    #[tokio::test]
    async fn chunk_stream_yields_typed_records() {
        let first = chunk_line("Hel");
        let second = chunk_line("lo");
        // Split the second record across two network chunks.
        let (a, b) = second.split_at(20);
        let stream = ChunkStream::new(
            body(&[first.as_str(), ": ping\n\n", a, b, "data: [DONE]\n\n"]),
            Duration::from_secs(5),
            None,
        );
        let text: Vec<String> = stream.into_text().try_collect().await.unwrap();
        assert_eq!(text, vec!["Hel".to_owned(), "lo".to_owned()]);
    }

    #[tokio::test]
    async fn chunk_stream_skips_line_with_invalid_utf8() {
        let mut bad = b"data: {\"x\":\"".to_vec();
        bad.extend_from_slice(&[0xff, 0xfe]);
        bad.extend_from_slice(b"\"}\n\n");
        let chunks = vec![
            chunk_line("a").into_bytes(),
            bad,
            chunk_line("b").into_bytes(),
            b"data: [DONE]\n\n".to_vec(),
        ];
        let mut stream = ChunkStream::new(
            stream::iter(chunks.into_iter().map(Ok)),
            Duration::from_secs(5),
            None,
        );

        let mut text = Vec::new();
        while let Some(chunk) = stream.next().await {
            text.push(chunk.unwrap().first_text().unwrap_or_default().to_owned());
        }
        assert_eq!(text, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(stream.state(), DecoderState::Done);
        assert_eq!(stream.stats().malformed_lines, 1);
        assert_eq!(stream.stats().errors, 0);
    }

    #[tokio::test]
    async fn chunk_stream_buffers_recent_text() {
        let (a, b, c) = (chunk_line("Hello, "), chunk_line("wide "), chunk_line("world"));
        let mut stream = ChunkStream::new(
            body(&[a.as_str(), b.as_str(), c.as_str(), "data: [DONE]\n\n"]),
            Duration::from_secs(5),
            None,
        )
        .with_buffer_capacity(12);

        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(stream.buffered_text(), "Hello, ");
        stream.clear_buffer();
        assert_eq!(stream.buffered_text(), "");

        while stream.next().await.is_some() {}
        assert_eq!(stream.buffered_text(), "wide world");
    }

    #[tokio::test]
    async fn chunk_stream_fails_on_endless_line() {
        let endless = stream::repeat_with(|| Ok(vec![b'x'; 64 * 1024]));
        let mut stream = ChunkStream::new(endless, Duration::from_secs(5), None);
        assert!(matches!(
            stream.next().await,
            Some(Err(InferenceError::StreamProtocol { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert!(!stream.holds_connection());
    }

    #[tokio::test]
    async fn chunk_stream_stats_track_progress() {
        let first = chunk_line("a");
        let mut stream = ChunkStream::new(
            body(&[first.as_str(), "data: oops\n\n", "data: [DONE]\n\n"]),
            Duration::from_secs(5),
            None,
        );
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
        let stats = stream.stats();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.content_deltas, 1);
        assert_eq!(stats.malformed_lines, 1);
        assert_eq!(stats.chunks_received, 3);
        assert!(stats.is_finished());
        assert_eq!(stream.state(), DecoderState::Done);
        assert!(!stream.holds_connection());
    }

    #[tokio::test]
    async fn chunk_stream_wrong_shape_fails_closed() {
        let mut stream = ChunkStream::new(
            body(&["data: {\"a\":1}\n\n", chunk_line("x").as_str()]),
            Duration::from_secs(5),
            None,
        );
        assert!(matches!(
            stream.next().await,
            Some(Err(InferenceError::StreamProtocol { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.stats().errors, 1);
    }

    #[tokio::test]
    async fn chunk_stream_times_out_on_stall() {
        let stalled = body(&[chunk_line("a").as_str()]).chain(stream::pending());
        let mut stream = ChunkStream::new(stalled, Duration::from_millis(50), None);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await,
            Some(Err(InferenceError::Timeout { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn chunk_stream_ends_at_body_end_without_sentinel() {
        let tail = chunk_line("z");
        let unterminated = tail.trim_end();
        let mut stream = ChunkStream::new(body(&[unterminated]), Duration::from_secs(5), None);
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.first_text(), Some("z"));
        assert!(stream.next().await.is_none());
    }
}
