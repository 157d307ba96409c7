//! Registry of open completion streams.
//!
//! A [`StreamRegistry`] is an ordinary value owned by whoever opens the
//! streams (an [`InferenceService`](crate::InferenceService) keeps one).
//! Each registered stream gets a [`StreamEntry`] that flips to finished when
//! the stream ends or is dropped.  Finished entries stay visible, with their
//! final stats, until [`StreamRegistry::cleanup_completed`] or
//! [`StreamRegistry::remove`] drops them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{InferenceError, Result};
use crate::observer::InferenceObserver;
use crate::streaming::{ChunkStream, StreamStats};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Registry record for one stream.
#[derive(Debug)]
pub struct StreamEntry {
    id: String,
    opened: Instant,
    /// Final stats, set once the stream is over.
    outcome: Mutex<Option<StreamStats>>,
}

impl StreamEntry {
    fn new(id: String) -> Self {
        Self {
            id,
            opened: Instant::now(),
            outcome: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<StreamStats>> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Time since the entry was registered.
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().is_some()
    }

    /// Final stats of a finished stream.
    pub fn stats(&self) -> Option<StreamStats> {
        self.lock().clone()
    }
}

impl InferenceObserver for StreamEntry {
    fn on_complete(&self, stats: &StreamStats) {
        *self.lock() = Some(stats.clone());
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<StreamEntry>>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<StreamEntry>>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an entry under `id`.
    ///
    /// A finished entry with the same id is replaced.  An id that is still
    /// in use by an open stream is rejected with
    /// [`InferenceError::InvalidRequest`].
    pub fn register(&self, id: impl Into<String>) -> Result<Arc<StreamEntry>> {
        let id = id.into();
        let mut streams = self.lock();
        if streams.get(&id).is_some_and(|entry| !entry.is_finished()) {
            return Err(InferenceError::InvalidRequest {
                reason: format!("stream {id:?} is already active"),
            });
        }
        let entry = Arc::new(StreamEntry::new(id.clone()));
        streams.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Register `stream` under `id` and hook its completion to the entry.
    pub fn attach(
        &self,
        id: impl Into<String>,
        stream: &mut ChunkStream,
    ) -> Result<Arc<StreamEntry>> {
        let entry = self.register(id)?;
        stream.set_id(entry.id());
        stream.add_observer(Arc::clone(&entry) as Arc<dyn InferenceObserver>);
        if stream.stats().is_finished() {
            entry.on_complete(stream.stats());
        }
        tracing::debug!(id = entry.id(), "stream registered");
        Ok(entry)
    }

    /// Register `stream` under a fresh `stream-<n>` id.
    pub fn track(&self, stream: &mut ChunkStream) -> Arc<StreamEntry> {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            if let Ok(entry) = self.attach(format!("stream-{n}"), stream) {
                return entry;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<StreamEntry>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<StreamEntry>> {
        self.lock().remove(id)
    }

    /// Ids of streams that have not finished yet, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|entry| !entry.is_finished())
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop every finished entry and return how many were removed.
    pub fn cleanup_completed(&self) -> usize {
        let mut streams = self.lock();
        let before = streams.len();
        streams.retain(|_, entry| !entry.is_finished());
        let removed = before - streams.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = streams.len(), "cleaned up finished streams");
        }
        removed
    }

    /// Entries currently held, finished or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
