pub mod config;
pub mod db;
pub mod events;
pub mod query;
pub mod recorder;
pub mod registry;
pub mod rpc;
pub mod run;

pub use events::EventBus;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{info, warn};

use bat_types::{
    config::BatConfig,
    rpc::{RpcRequest, RpcResponse},
    run::AgentRunContext,
};

use db::Database;
use query::{QueryLimits, TraceQuery};
use recorder::{FlushWindow, TraceAttachment, TraceCache, TraceRecorder};
use registry::RunRegistry;
use run::AgentRun;

/// The central gateway. Owns the run registry, the event bus and the trace
/// store. Must be created inside a tokio runtime.
pub struct Gateway {
    runs: Arc<RunRegistry>,
    event_bus: EventBus,
    cache: Arc<TraceCache>,
    recorder: Option<TraceRecorder>,
    query: Option<TraceQuery>,
    attachment: Mutex<Option<TraceAttachment>>,
}

impl Gateway {
    pub fn new(config: BatConfig, db: Arc<Database>) -> Result<Self> {
        // A run unknown to this process continues after its last logged event.
        let seed_db = Arc::clone(&db);
        let runs = Arc::new(RunRegistry::with_seq_seed(move |run_id| {
            seed_db.max_trace_seq(run_id).unwrap_or_else(|e| {
                warn!(run_id = %run_id, "Failed to read last trace seq: {:#}", e);
                0
            })
        }));
        let event_bus = EventBus::new(Arc::clone(&runs));
        let cache = Arc::new(TraceCache::new());

        let (recorder, query, attachment) = if config.trace.enabled {
            let recorder = TraceRecorder::new(
                Arc::clone(&db),
                Arc::clone(&cache),
                FlushWindow::from(&config.trace),
            );
            let query = TraceQuery::new(
                Arc::clone(&db),
                Arc::clone(&cache),
                QueryLimits::from(&config.trace),
            );
            let attachment = recorder.attach(&event_bus);
            info!(
                "Trace recorder attached (debounce {}ms)",
                config.trace.flush_debounce_ms
            );
            (Some(recorder), Some(query), Some(attachment))
        } else {
            info!("Tracing disabled by config");
            (None, None, None)
        };

        Ok(Self {
            runs,
            event_bus,
            cache,
            recorder,
            query,
            attachment: Mutex::new(attachment),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Begin a new agent run; see [`AgentRun`].
    pub fn start_run(&self, context: AgentRunContext) -> AgentRun {
        AgentRun::start(&self.event_bus, context)
    }

    pub fn trace_query(&self) -> Option<&TraceQuery> {
        self.query.as_ref()
    }

    /// Serve one RPC request. Database reads run on the blocking pool.
    pub async fn handle_rpc(&self, request: RpcRequest) -> RpcResponse {
        let query = self.query.clone();
        let id = request.id.clone();
        match tokio::task::spawn_blocking(move || rpc::handle_request(query.as_ref(), &request))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("RPC handler task failed: {}", e);
                RpcResponse::err(
                    id,
                    bat_types::rpc::RpcErrorCode::Unavailable,
                    "request handler failed",
                )
            }
        }
    }

    /// Drop cached run summaries. Durable logs, the persisted index, live
    /// run contexts and sequence counters are kept.
    pub fn reset_state(&self) {
        self.cache.reset();
    }

    /// Stop recording, drain queued events and persist pending summaries.
    pub async fn shutdown(&self) -> Result<()> {
        let attachment = self.attachment.lock().unwrap().take();
        if let Some(attachment) = attachment {
            attachment.detach().await;
        }
        if let Some(recorder) = self.recorder.clone() {
            let flushed = tokio::task::spawn_blocking(move || recorder.flush_now()).await??;
            info!("Gateway shut down, flushed {} trace summaries", flushed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bat_types::rpc::{RpcErrorCode, TRACE_RUNS_LIST, TRACE_RUN_GET};
    use bat_types::trace::{AgentEventPayload, NewAgentEvent, TraceRunStatus};
    use serde_json::json;

    use run::RunOutcome;

    fn test_config() -> BatConfig {
        let mut config = BatConfig::default();
        config.trace.flush_debounce_ms = 20;
        config.trace.flush_max_delay_ms = 200;
        config
    }

    fn request(method: &str, params: serde_json::Value) -> RpcRequest {
        RpcRequest {
            id: "1".to_string(),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn runs_flow_from_bus_to_rpc() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gateway = Gateway::new(test_config(), Arc::clone(&db)).unwrap();

        let run = gateway.start_run(AgentRunContext::new("agent:main"));
        let run_id = run.run_id().to_string();
        run.emit(AgentEventPayload::tool_start("web_fetch", "t1", json!({"url": "https://example.com"})));
        run.emit(AgentEventPayload::tool_result("web_fetch", "t1", true));
        run.finish(RunOutcome::Completed);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let res = gateway
            .handle_rpc(request(TRACE_RUN_GET, json!({"runId": run_id})))
            .await;
        let payload = res.payload.unwrap();
        assert_eq!(payload["events"].as_array().unwrap().len(), 4);
        assert_eq!(payload["truncated"], false);
        assert_eq!(payload["events"][0]["sessionKey"], "agent:main");

        let res = gateway
            .handle_rpc(request(TRACE_RUNS_LIST, json!({"limit": 10})))
            .await;
        let runs = res.payload.unwrap();
        assert_eq!(runs[0]["runId"], run_id.as_str());
        assert_eq!(runs[0]["status"], "ended");
        assert_eq!(runs[0]["toolCalls"], 1);
        assert_eq!(runs[0]["toolErrors"], 1);

        // The debounce window has passed, so the summary is persisted too.
        assert_eq!(db.get_trace_run(&run_id).unwrap().unwrap().tool_errors, 1);
    }

    #[tokio::test]
    async fn shutdown_persists_pending_summaries() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut config = test_config();
        config.trace.flush_debounce_ms = 60_000;
        config.trace.flush_max_delay_ms = 60_000;
        let gateway = Gateway::new(config, Arc::clone(&db)).unwrap();

        let run = gateway.start_run(AgentRunContext::new("heartbeat").heartbeat());
        let run_id = run.run_id().to_string();
        run.finish(RunOutcome::Aborted);

        gateway.shutdown().await.unwrap();

        let meta = db.get_trace_run(&run_id).unwrap().unwrap();
        assert_eq!(meta.status, TraceRunStatus::Aborted);
        assert_eq!(db.load_trace_log(&run_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reset_state_keeps_persisted_traces() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gateway = Gateway::new(test_config(), Arc::clone(&db)).unwrap();

        let run = gateway.start_run(AgentRunContext::new("main"));
        let run_id = run.run_id().to_string();
        run.finish(RunOutcome::Completed);
        tokio::time::sleep(Duration::from_millis(150)).await;

        gateway.reset_state();
        assert_eq!(gateway.runs().active_runs(), 0);

        let runs = gateway.trace_query().unwrap().list_trace_runs(None);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, run_id);
    }

    #[tokio::test]
    async fn disabled_tracing_reports_unavailable() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut config = test_config();
        config.trace.enabled = false;
        let gateway = Gateway::new(config, Arc::clone(&db)).unwrap();

        assert_eq!(gateway.event_bus().listener_count(), 0);
        let run = gateway.start_run(AgentRunContext::new("main"));
        run.finish(RunOutcome::Completed);

        let res = gateway.handle_rpc(request(TRACE_RUNS_LIST, json!({}))).await;
        assert_eq!(res.error.unwrap().code, RpcErrorCode::Unavailable);
        assert!(db.list_trace_event_run_ids().unwrap().is_empty());
        gateway.shutdown().await.unwrap();
    }

    fn log_seqs(db: &Database, run_id: &str) -> Vec<u64> {
        db.load_trace_log(run_id).unwrap().iter().map(|e| e.seq).collect()
    }

    #[tokio::test]
    async fn reset_mid_run_keeps_sequences_going() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gateway = Gateway::new(test_config(), Arc::clone(&db)).unwrap();

        let run = gateway.start_run(AgentRunContext::new("main"));
        let run_id = run.run_id().to_string();
        run.emit(AgentEventPayload::tool_start("fs_read", "t1", json!({})));
        gateway.reset_state();
        run.emit(AgentEventPayload::tool_result("fs_read", "t1", false));
        run.finish(RunOutcome::Completed);
        gateway.shutdown().await.unwrap();

        assert_eq!(log_seqs(&db, &run_id), vec![1, 2, 3, 4]);
        let page = gateway
            .trace_query()
            .unwrap()
            .get_trace_run_events(&run_id, Some(100), Some(2));
        assert_eq!(page.events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn restarted_gateway_resumes_run_sequence() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let first = Gateway::new(test_config(), Arc::clone(&db)).unwrap();
        first
            .event_bus()
            .emit_agent_event(NewAgentEvent::new("run-r", AgentEventPayload::lifecycle_start(1)));
        first
            .event_bus()
            .emit_agent_event(NewAgentEvent::new("run-r", AgentEventPayload::message_delta("a", "a")));
        first.shutdown().await.unwrap();

        let second = Gateway::new(test_config(), Arc::clone(&db)).unwrap();
        let evt = second
            .event_bus()
            .emit_agent_event(NewAgentEvent::new("run-r", AgentEventPayload::lifecycle_end(2)))
            .unwrap();
        assert_eq!(evt.seq, 3);
        second.shutdown().await.unwrap();

        assert_eq!(log_seqs(&db, "run-r"), vec![1, 2, 3]);
        assert_eq!(db.get_trace_run("run-r").unwrap().unwrap().status, TraceRunStatus::Ended);
    }
}
