use serde::{Deserialize, Serialize};

/// Per-run context registered by the dispatcher while a run is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunContext {
    pub session_key: String,
    /// Id the requesting client knows this run by, if it differs from the run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_run_id: Option<String>,
    /// Set for sub-agent runs spawned from another run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub is_heartbeat: bool,
}

impl AgentRunContext {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            client_run_id: None,
            parent_run_id: None,
            is_heartbeat: false,
        }
    }

    pub fn with_client_run_id(mut self, client_run_id: impl Into<String>) -> Self {
        self.client_run_id = Some(client_run_id.into());
        self
    }

    pub fn with_parent_run_id(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn heartbeat(mut self) -> Self {
        self.is_heartbeat = true;
        self
    }
}
