use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use bat_types::config::TraceConfig;
use bat_types::trace::{sort_most_recent_first, TraceRunEvents, TraceRunMeta};

use crate::db::Database;
use crate::recorder::TraceCache;

/// Default and maximum page sizes for trace reads.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub list_default: usize,
    pub list_max: usize,
    pub events_default: usize,
    pub events_max: usize,
}

impl From<&TraceConfig> for QueryLimits {
    fn from(config: &TraceConfig) -> Self {
        Self {
            list_default: config.list_default_limit as usize,
            list_max: config.list_max_limit as usize,
            events_default: config.events_default_limit as usize,
            events_max: config.events_max_limit as usize,
        }
    }
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self::from(&TraceConfig::default())
    }
}

/// Read side of the trace store. Storage errors degrade to empty results.
#[derive(Clone)]
pub struct TraceQuery {
    db: Arc<Database>,
    cache: Arc<TraceCache>,
    limits: QueryLimits,
}

impl TraceQuery {
    pub fn new(db: Arc<Database>, cache: Arc<TraceCache>, limits: QueryLimits) -> Self {
        Self { db, cache, limits }
    }

    /// Up to `limit` run summaries, most recent first. Cached summaries win
    /// over persisted ones since they may not be flushed yet.
    pub fn list_trace_runs(&self, limit: Option<usize>) -> Vec<TraceRunMeta> {
        let limit = limit
            .unwrap_or(self.limits.list_default)
            .min(self.limits.list_max);

        let persisted = self.db.list_trace_runs(limit).unwrap_or_else(|e| {
            warn!("Failed to list trace runs: {:#}", e);
            Vec::new()
        });

        let mut merged: HashMap<String, TraceRunMeta> = persisted
            .into_iter()
            .map(|run| (run.run_id.clone(), run))
            .collect();
        for run in self.cache.snapshot() {
            merged.insert(run.run_id.clone(), run);
        }

        let mut runs: Vec<TraceRunMeta> = merged.into_values().collect();
        sort_most_recent_first(&mut runs);
        runs.truncate(limit);
        runs
    }

    /// One run's summary, cached or persisted.
    pub fn get_trace_run(&self, run_id: &str) -> Option<TraceRunMeta> {
        if let Some(run) = self.cache.get(run_id) {
            return Some(run);
        }
        self.db.get_trace_run(run_id).unwrap_or_else(|e| {
            warn!(run_id = %run_id, "Failed to load trace run: {:#}", e);
            None
        })
    }

    /// Replay a run's log from the start (or after `after_seq`), returning at
    /// most `limit` events. Unknown runs yield an empty page.
    pub fn get_trace_run_events(
        &self,
        run_id: &str,
        limit: Option<usize>,
        after_seq: Option<u64>,
    ) -> TraceRunEvents {
        let limit = limit
            .unwrap_or(self.limits.events_default)
            .min(self.limits.events_max);

        match self.db.get_trace_events(run_id, after_seq, limit) {
            Ok((events, truncated)) => TraceRunEvents {
                run_id: run_id.to_string(),
                events,
                truncated,
            },
            Err(e) => {
                warn!(run_id = %run_id, "Failed to load trace events: {:#}", e);
                TraceRunEvents::empty(run_id)
            }
        }
    }
}
