//! Trace recorder: turns the live event stream into durable history.
//!
//! Every event is appended to the run's log in the database, and folded into
//! an in-memory [`TraceRunMeta`]. Summaries are not written per event: a
//! flusher task persists dirty summaries once a burst of events goes quiet
//! (or after `max_delay` if it never does).

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bat_types::config::TraceConfig;
use bat_types::trace::{AgentEvent, TraceRunMeta};

use crate::db::Database;
use crate::events::{EventBus, ListenerHandle};

// ─── Summary cache ────────────────────────────────────────────────────────────

/// In-memory run summaries, plus the set not yet persisted.
///
/// Finished runs are evicted once their final summary is persisted; readers
/// fall back to the index for them.
#[derive(Default)]
pub struct TraceCache {
    inner: Mutex<CacheInner>,
    /// Held across take-dirty and write so flushes land in order.
    flush_lock: Mutex<()>,
}

#[derive(Default)]
struct CacheInner {
    runs: HashMap<String, TraceRunMeta>,
    dirty: HashSet<String>,
}

impl TraceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &str) -> Option<TraceRunMeta> {
        self.inner.lock().unwrap().runs.get(run_id).cloned()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().unwrap().runs.contains_key(run_id)
    }

    pub fn snapshot(&self) -> Vec<TraceRunMeta> {
        self.inner.lock().unwrap().runs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of summaries changed since the last successful flush.
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().unwrap().dirty.len()
    }

    /// Forget every cached summary. Durable logs and the persisted index are
    /// untouched.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.runs.clear();
        inner.dirty.clear();
    }

    /// Fold an event into the run's summary, creating it from `seed` (or
    /// fresh) on first sight. Returns whether the summary changed.
    fn apply(
        &self,
        run_id: &str,
        event: &AgentEvent,
        client_run_id: Option<&str>,
        session_key: Option<&str>,
        seed: Option<TraceRunMeta>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let CacheInner { runs, dirty } = &mut *inner;

        let meta = match runs.entry(run_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let meta = seed.unwrap_or_else(|| TraceRunMeta::new(run_id, event.ts));
                // Already finished and persisted: nothing to cache.
                if meta.status.is_terminal() {
                    return false;
                }
                entry.insert(meta)
            }
        };
        if meta.status.is_terminal() {
            return false;
        }
        if meta.client_run_id.is_none() {
            meta.client_run_id = client_run_id.map(str::to_string);
        }
        if meta.session_key.is_none() {
            meta.session_key = session_key.map(str::to_string);
        }
        if !meta.apply(event) {
            return false;
        }
        dirty.insert(run_id.to_string());
        true
    }

    fn take_dirty(&self) -> Vec<TraceRunMeta> {
        let mut inner = self.inner.lock().unwrap();
        let CacheInner { runs, dirty } = &mut *inner;
        dirty
            .drain()
            .filter_map(|run_id| runs.get(&run_id).cloned())
            .collect()
    }

    /// Drop finished runs that were just persisted and not touched since.
    fn evict_persisted(&self, flushed: &[TraceRunMeta]) {
        let mut inner = self.inner.lock().unwrap();
        let CacheInner { runs, dirty } = &mut *inner;
        for run in flushed {
            if !run.status.is_terminal() || dirty.contains(&run.run_id) {
                continue;
            }
            runs.remove(&run.run_id);
        }
    }

    /// Keep only summaries that still have to be flushed.
    fn retain_dirty(&self) {
        let mut inner = self.inner.lock().unwrap();
        let CacheInner { runs, dirty } = &mut *inner;
        runs.retain(|run_id, _| dirty.contains(run_id));
    }

    fn mark_dirty(&self, runs: &[TraceRunMeta]) {
        let mut inner = self.inner.lock().unwrap();
        for run in runs {
            if inner.runs.contains_key(&run.run_id) {
                inner.dirty.insert(run.run_id.clone());
            }
        }
    }
}

// ─── Recorder ─────────────────────────────────────────────────────────────────

/// Input to [`TraceRecorder::record_trace_agent_event`].
#[derive(Debug, Clone)]
pub struct TraceEventRecord {
    pub run_id: String,
    pub event: AgentEvent,
    pub client_run_id: Option<String>,
    pub session_key: Option<String>,
}

impl TraceEventRecord {
    pub fn new(event: AgentEvent) -> Self {
        Self {
            run_id: event.run_id.clone(),
            session_key: event.session_key.clone(),
            client_run_id: None,
            event,
        }
    }
}

/// Timing of summary flushes.
#[derive(Debug, Clone, Copy)]
pub struct FlushWindow {
    pub debounce: Duration,
    pub max_delay: Duration,
}

impl From<&TraceConfig> for FlushWindow {
    fn from(config: &TraceConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.flush_debounce_ms),
            max_delay: Duration::from_millis(config.flush_max_delay_ms),
        }
    }
}

#[derive(Clone)]
pub struct TraceRecorder {
    db: Arc<Database>,
    cache: Arc<TraceCache>,
    flush_tx: mpsc::UnboundedSender<()>,
}

impl TraceRecorder {
    /// Create a recorder and spawn its flusher task. Must be called from
    /// within a tokio runtime. The flusher exits, after a final flush, once
    /// every clone of the recorder is dropped.
    pub fn new(db: Arc<Database>, cache: Arc<TraceCache>, window: FlushWindow) -> Self {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_flusher(
            Arc::clone(&db),
            Arc::clone(&cache),
            window,
            flush_rx,
        ));
        Self {
            db,
            cache,
            flush_tx,
        }
    }

    pub fn cache(&self) -> &Arc<TraceCache> {
        &self.cache
    }

    /// Append an event to its run's log and update the run summary.
    ///
    /// Never fails: persistence errors are logged and the cached summary
    /// stays authoritative until the next successful flush.
    pub fn record_trace_agent_event(&self, record: TraceEventRecord) {
        let TraceEventRecord {
            run_id,
            event,
            client_run_id,
            session_key,
        } = record;

        if let Err(e) = self.db.append_trace_event(&run_id, &event) {
            warn!(run_id = %run_id, seq = event.seq, "Failed to append trace event: {:#}", e);
        }

        // A run seen by an earlier process continues from its persisted summary.
        let seed = if self.cache.contains(&run_id) {
            None
        } else {
            self.db.get_trace_run(&run_id).unwrap_or_else(|e| {
                warn!(run_id = %run_id, "Failed to load trace summary: {:#}", e);
                None
            })
        };

        let session_key = session_key.or_else(|| event.session_key.clone());
        let changed = self.cache.apply(
            &run_id,
            &event,
            client_run_id.as_deref(),
            session_key.as_deref(),
            seed,
        );
        if changed {
            let _ = self.flush_tx.send(());
        } else {
            debug!(run_id = %run_id, seq = event.seq, "Late event for finished run");
        }
    }

    /// Persist every dirty summary now. Returns how many were written.
    pub fn flush_now(&self) -> Result<usize> {
        flush(&self.db, &self.cache)
    }

    /// Recompute every summary from the durable logs and overwrite the index.
    /// Returns the number of runs rebuilt. Summaries recorded but not yet
    /// flushed stay cached and win on the next flush.
    pub fn rebuild_index(&self) -> Result<usize> {
        let _flushing = self.cache.flush_lock.lock().unwrap();
        let mut rebuilt = Vec::new();
        for run_id in self.db.list_trace_event_run_ids()? {
            let events = self.db.load_trace_log(&run_id)?;
            let Some(first) = events.first() else {
                continue;
            };
            let mut meta = TraceRunMeta::new(&run_id, first.ts);
            if let Some(existing) = self.db.get_trace_run(&run_id)? {
                meta.client_run_id = existing.client_run_id;
            }
            for event in &events {
                meta.apply(event);
            }
            rebuilt.push(meta);
        }

        self.db.upsert_trace_runs(&rebuilt)?;
        self.cache.retain_dirty();
        info!("Rebuilt trace index for {} runs", rebuilt.len());
        Ok(rebuilt.len())
    }

    /// Feed this recorder from a bus. The bus listener only enqueues; a
    /// writer task does the database work in batches.
    pub fn attach(&self, bus: &EventBus) -> TraceAttachment {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceEventRecord>();
        let runs = Arc::clone(bus.runs());

        let listener = bus.on_agent_event(move |event| {
            let mut record = TraceEventRecord::new(event.clone());
            if let Some(ctx) = runs.get_agent_run_context(&event.run_id) {
                record.client_run_id = ctx.client_run_id;
                if record.session_key.is_none() {
                    record.session_key = Some(ctx.session_key);
                }
            }
            let _ = tx.send(record);
        });

        let recorder = self.clone();
        let writer = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                let recorder = recorder.clone();
                let result = tokio::task::spawn_blocking(move || {
                    for record in batch {
                        recorder.record_trace_agent_event(record);
                    }
                })
                .await;
                if let Err(e) = result {
                    warn!("Trace writer batch failed: {}", e);
                }
            }
            debug!("Trace writer stopped");
        });

        TraceAttachment { listener, writer }
    }
}

/// A recorder's subscription to a bus.
pub struct TraceAttachment {
    listener: ListenerHandle,
    writer: JoinHandle<()>,
}

impl TraceAttachment {
    /// Stop listening and wait until every queued event has been recorded.
    pub async fn detach(self) {
        self.listener.unsubscribe();
        if let Err(e) = self.writer.await {
            warn!("Trace writer task failed: {}", e);
        }
    }
}

fn flush(db: &Database, cache: &TraceCache) -> Result<usize> {
    let _flushing = cache.flush_lock.lock().unwrap();
    let dirty = cache.take_dirty();
    if dirty.is_empty() {
        return Ok(0);
    }
    if let Err(e) = db.upsert_trace_runs(&dirty) {
        cache.mark_dirty(&dirty);
        return Err(e);
    }
    cache.evict_persisted(&dirty);
    debug!("Flushed {} trace summaries", dirty.len());
    Ok(dirty.len())
}

/// One timer for the whole recorder: each signal restarts the quiet period,
/// bounded by `max_delay` from the first signal of the burst.
async fn run_flusher(
    db: Arc<Database>,
    cache: Arc<TraceCache>,
    window: FlushWindow,
    mut signals: mpsc::UnboundedReceiver<()>,
) {
    while signals.recv().await.is_some() {
        let deadline = Instant::now() + window.max_delay;
        loop {
            let quiet_until = (Instant::now() + window.debounce).min(deadline);
            match tokio::time::timeout_at(quiet_until, signals.recv()).await {
                Ok(Some(())) if Instant::now() < deadline => continue,
                _ => break,
            }
        }

        let db = Arc::clone(&db);
        let cache = Arc::clone(&cache);
        match tokio::task::spawn_blocking(move || flush(&db, &cache)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to flush trace summaries: {:#}", e),
            Err(e) => warn!("Trace flush task failed: {}", e),
        }
    }
    debug!("Trace flusher stopped");
}
