use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use bat_types::run::AgentRunContext;

/// How many finished runs keep their sequence counter in memory.
const RETIRED_SEQ_CAPACITY: usize = 1024;

/// Supplies the last sequence number already used by a run this registry has
/// no counter for (e.g. `MAX(seq)` of its durable log).
type SeqSeed = Box<dyn Fn(&str) -> u64 + Send + Sync>;

#[derive(Default)]
struct SeqState {
    counters: HashMap<String, u64>,
    /// Cleared runs, oldest first. Their counters are dropped past capacity.
    retired: VecDeque<String>,
}

/// Per-run identity state shared by the event bus and the run dispatcher:
/// the context of live runs and one sequence counter per run id.
///
/// Sequence counters outlive the context: a late event for a cleared run must
/// still continue its sequence rather than restart at 1. Only the most recent
/// `RETIRED_SEQ_CAPACITY` finished runs keep theirs; an older run that emits
/// again is resumed through the seed.
pub struct RunRegistry {
    contexts: RwLock<HashMap<String, AgentRunContext>>,
    seqs: Mutex<SeqState>,
    seed: Option<SeqSeed>,
    retired_capacity: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            seqs: Mutex::new(SeqState::default()),
            seed: None,
            retired_capacity: RETIRED_SEQ_CAPACITY,
        }
    }

    /// A registry that resumes unknown runs from `seed` instead of 0.
    pub fn with_seq_seed<F>(seed: F) -> Self
    where
        F: Fn(&str) -> u64 + Send + Sync + 'static,
    {
        Self {
            seed: Some(Box::new(seed)),
            ..Self::new()
        }
    }

    pub fn with_retired_capacity(mut self, capacity: usize) -> Self {
        self.retired_capacity = capacity;
        self
    }

    /// Store the context for a run, replacing any previous entry.
    pub fn register_agent_run_context(&self, run_id: &str, context: AgentRunContext) {
        self.contexts
            .write()
            .unwrap()
            .insert(run_id.to_string(), context);
    }

    pub fn get_agent_run_context(&self, run_id: &str) -> Option<AgentRunContext> {
        self.contexts.read().unwrap().get(run_id).cloned()
    }

    /// Remove the context for a run. Clearing an absent run is a no-op.
    pub fn clear_agent_run_context(&self, run_id: &str) {
        let mut contexts = self.contexts.write().unwrap();
        contexts.remove(run_id);

        let mut seqs = self.seqs.lock().unwrap();
        if seqs.counters.contains_key(run_id) {
            seqs.retired.push_back(run_id.to_string());
        }
        while seqs.retired.len() > self.retired_capacity {
            let Some(oldest) = seqs.retired.pop_front() else {
                break;
            };
            // Re-registered since it was cleared: still live.
            if !contexts.contains_key(&oldest) {
                seqs.counters.remove(&oldest);
            }
        }
    }

    /// Number of runs with a registered context.
    pub fn active_runs(&self) -> usize {
        self.contexts.read().unwrap().len()
    }

    /// Next sequence number for a run, starting at 1 (or after the seed).
    pub fn next_seq(&self, run_id: &str) -> u64 {
        if let Some(seq) = self.seqs.lock().unwrap().counters.get_mut(run_id) {
            *seq += 1;
            return *seq;
        }

        // Seed outside the lock; it may hit storage.
        let base = self.seed.as_ref().map(|seed| seed(run_id)).unwrap_or(0);
        let mut seqs = self.seqs.lock().unwrap();
        let seq = seqs.counters.entry(run_id.to_string()).or_insert(base);
        *seq += 1;
        *seq
    }

    /// Drop all contexts and sequence counters.
    pub fn reset(&self) {
        let mut contexts = self.contexts.write().unwrap();
        let mut seqs = self.seqs.lock().unwrap();
        contexts.clear();
        seqs.counters.clear();
        seqs.retired.clear();
    }

    #[cfg(test)]
    fn tracked_seqs(&self) -> usize {
        self.seqs.lock().unwrap().counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_lifecycle() {
        let registry = RunRegistry::new();
        registry.register_agent_run_context("r", AgentRunContext::new("main"));
        assert_eq!(
            registry.get_agent_run_context("r"),
            Some(AgentRunContext::new("main"))
        );

        registry.clear_agent_run_context("r");
        assert_eq!(registry.get_agent_run_context("r"), None);

        // Clearing twice is fine.
        registry.clear_agent_run_context("r");
        registry.clear_agent_run_context("never-registered");
        assert_eq!(registry.active_runs(), 0);
    }

    #[test]
    fn register_overwrites() {
        let registry = RunRegistry::new();
        registry.register_agent_run_context("r", AgentRunContext::new("main"));
        registry.register_agent_run_context("r", AgentRunContext::new("subagent:1").heartbeat());

        let ctx = registry.get_agent_run_context("r").unwrap();
        assert_eq!(ctx.session_key, "subagent:1");
        assert!(ctx.is_heartbeat);
        assert_eq!(registry.active_runs(), 1);
    }

    #[test]
    fn sequences_are_per_run() {
        let registry = RunRegistry::new();
        assert_eq!(registry.next_seq("a"), 1);
        assert_eq!(registry.next_seq("a"), 2);
        assert_eq!(registry.next_seq("b"), 1);
        assert_eq!(registry.next_seq("a"), 3);
    }

    #[test]
    fn sequence_survives_context_clear() {
        let registry = RunRegistry::new();
        registry.register_agent_run_context("a", AgentRunContext::new("main"));
        registry.next_seq("a");
        registry.clear_agent_run_context("a");
        assert_eq!(registry.next_seq("a"), 2);

        registry.reset();
        assert_eq!(registry.next_seq("a"), 1);
    }

    #[test]
    fn seed_resumes_unknown_runs() {
        let registry = RunRegistry::with_seq_seed(|run_id| if run_id == "old" { 7 } else { 0 });
        assert_eq!(registry.next_seq("old"), 8);
        assert_eq!(registry.next_seq("old"), 9);
        assert_eq!(registry.next_seq("new"), 1);
    }

    #[test]
    fn retired_counters_are_bounded() {
        let registry = RunRegistry::with_seq_seed(|_| 40).with_retired_capacity(2);
        for run_id in ["a", "b", "c", "d"] {
            registry.register_agent_run_context(run_id, AgentRunContext::new("main"));
            registry.next_seq(run_id);
            registry.clear_agent_run_context(run_id);
        }
        assert_eq!(registry.tracked_seqs(), 2);

        // Recent runs continue in memory; evicted ones go back to the seed.
        assert_eq!(registry.next_seq("d"), 42);
        assert_eq!(registry.next_seq("a"), 41);
    }

    #[test]
    fn live_runs_keep_counters_past_capacity() {
        let registry = RunRegistry::new().with_retired_capacity(1);
        registry.register_agent_run_context("a", AgentRunContext::new("main"));
        registry.next_seq("a");
        registry.clear_agent_run_context("a");
        // Same id comes back before its retired entry is evicted.
        registry.register_agent_run_context("a", AgentRunContext::new("main"));
        registry.next_seq("a");

        registry.register_agent_run_context("b", AgentRunContext::new("main"));
        registry.next_seq("b");
        registry.clear_agent_run_context("b");

        assert_eq!(registry.next_seq("a"), 3);
    }
}
