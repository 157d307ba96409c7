//! Progress hooks for requests and streams.
//!
//! Implement [`InferenceObserver`] and attach it to an
//! [`InferenceService`](crate::InferenceService) or directly to a
//! [`ChunkStream`](crate::ChunkStream).  Every method has an empty default,
//! so an observer only overrides the events it cares about.  Hooks run
//! inline on the task that drives the request and should return quickly.

use std::time::Duration;

use crate::error::InferenceError;
use crate::streaming::StreamStats;
use crate::types::ChatCompletionResponse;

pub trait InferenceObserver: Send + Sync {
    /// A typed record was decoded from a stream.
    fn on_chunk(&self, _chunk: &ChatCompletionResponse) {}

    /// A stream ended with `error`.  [`on_complete`](Self::on_complete)
    /// follows.
    fn on_error(&self, _error: &InferenceError) {}

    /// Retry number `retry` (starting at 1) will run after `delay` because
    /// the previous attempt failed with `error`.
    fn on_retry(&self, _retry: u32, _error: &InferenceError, _delay: Duration) {}

    /// A stream reached a terminal state, or was dropped before it did.
    fn on_complete(&self, _stats: &StreamStats) {}
}
