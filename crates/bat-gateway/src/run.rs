use uuid::Uuid;

use bat_types::run::AgentRunContext;
use bat_types::trace::{now_ms, AgentEvent, AgentEventPayload, NewAgentEvent};

use crate::events::EventBus;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Aborted,
}

/// One live agent execution.
///
/// Registers the run context and emits `lifecycle/start` on creation; emits
/// the terminal lifecycle event and clears the context on [`finish`]. A run
/// dropped without finishing is reported as aborted.
///
/// [`finish`]: AgentRun::finish
pub struct AgentRun {
    run_id: String,
    bus: EventBus,
    finished: bool,
}

impl AgentRun {
    pub fn start(bus: &EventBus, context: AgentRunContext) -> Self {
        Self::start_with_id(bus, Uuid::new_v4().to_string(), context)
    }

    pub fn start_with_id(bus: &EventBus, run_id: impl Into<String>, context: AgentRunContext) -> Self {
        let run_id = run_id.into();
        bus.runs().register_agent_run_context(&run_id, context);
        let run = Self {
            run_id,
            bus: bus.clone(),
            finished: false,
        };
        run.emit(AgentEventPayload::lifecycle_start(now_ms()));
        run
    }

    /// Start a nested sub-agent run whose context points back at this one.
    pub fn spawn_child(&self, context: AgentRunContext) -> AgentRun {
        AgentRun::start(&self.bus, context.with_parent_run_id(self.run_id.clone()))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, payload: AgentEventPayload) -> Option<AgentEvent> {
        self.bus
            .emit_agent_event(NewAgentEvent::new(self.run_id.clone(), payload))
    }

    pub fn finish(mut self, outcome: RunOutcome) {
        self.end(outcome);
    }

    fn end(&mut self, outcome: RunOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        let ended_at = now_ms();
        let payload = match outcome {
            RunOutcome::Completed => AgentEventPayload::lifecycle_end(ended_at),
            RunOutcome::Failed(message) => AgentEventPayload::lifecycle_error(ended_at, message),
            RunOutcome::Aborted => AgentEventPayload::lifecycle_abort(ended_at),
        };
        self.emit(payload);
        self.bus.runs().clear_agent_run_context(&self.run_id);
    }
}

impl Drop for AgentRun {
    fn drop(&mut self) {
        self.end(RunOutcome::Aborted);
    }
}
