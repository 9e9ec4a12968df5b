use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `sessionKey` is always a string on the wire; `""` means unknown.
mod session_key_wire {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(key.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let key = Option::<String>::deserialize(d)?;
        Ok(key.filter(|k| !k.is_empty()))
    }
}

// ─── Event taxonomy ───────────────────────────────────────────────────────────

/// Discriminator of an event record (`stream` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStream {
    Lifecycle,
    Tool,
    Message,
    Compaction,
}

impl std::fmt::Display for AgentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Tool => write!(f, "tool"),
            Self::Message => write!(f, "message"),
            Self::Compaction => write!(f, "compaction"),
        }
    }
}

impl std::str::FromStr for AgentStream {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lifecycle" => Ok(Self::Lifecycle),
            "tool" => Ok(Self::Tool),
            "message" => Ok(Self::Message),
            "compaction" => Ok(Self::Compaction),
            _ => Err(anyhow::anyhow!("unknown agent stream: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Start,
    Update,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePhase {
    Start,
    Delta,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionPhase {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleData {
    pub phase: LifecyclePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolData {
    pub phase: ToolPhase,
    #[serde(default)]
    pub name: String,
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub phase: MessagePhase,
    /// Accumulated assistant text so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionData {
    pub phase: CompactionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub will_retry: Option<bool>,
}

/// Category-specific event body, serialized as `{"stream": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "data", rename_all = "lowercase")]
pub enum AgentEventPayload {
    Lifecycle(LifecycleData),
    Tool(ToolData),
    Message(MessageData),
    Compaction(CompactionData),
}

impl AgentEventPayload {
    pub fn stream(&self) -> AgentStream {
        match self {
            Self::Lifecycle(_) => AgentStream::Lifecycle,
            Self::Tool(_) => AgentStream::Tool,
            Self::Message(_) => AgentStream::Message,
            Self::Compaction(_) => AgentStream::Compaction,
        }
    }

    /// The `phase` field of the payload as it appears on the wire.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Lifecycle(d) => match d.phase {
                LifecyclePhase::Start => "start",
                LifecyclePhase::End => "end",
                LifecyclePhase::Error => "error",
                LifecyclePhase::Abort => "abort",
            },
            Self::Tool(d) => match d.phase {
                ToolPhase::Start => "start",
                ToolPhase::Update => "update",
                ToolPhase::Result => "result",
            },
            Self::Message(d) => match d.phase {
                MessagePhase::Start => "start",
                MessagePhase::Delta => "delta",
                MessagePhase::End => "end",
            },
            Self::Compaction(d) => match d.phase {
                CompactionPhase::Start => "start",
                CompactionPhase::End => "end",
            },
        }
    }

    pub fn lifecycle_start(started_at: i64) -> Self {
        Self::Lifecycle(LifecycleData {
            phase: LifecyclePhase::Start,
            started_at: Some(started_at),
            ended_at: None,
            error: None,
        })
    }

    pub fn lifecycle_end(ended_at: i64) -> Self {
        Self::lifecycle_terminal(LifecyclePhase::End, ended_at, None)
    }

    pub fn lifecycle_error(ended_at: i64, error: impl Into<String>) -> Self {
        Self::lifecycle_terminal(LifecyclePhase::Error, ended_at, Some(error.into()))
    }

    pub fn lifecycle_abort(ended_at: i64) -> Self {
        Self::lifecycle_terminal(LifecyclePhase::Abort, ended_at, None)
    }

    fn lifecycle_terminal(phase: LifecyclePhase, ended_at: i64, error: Option<String>) -> Self {
        Self::Lifecycle(LifecycleData {
            phase,
            started_at: None,
            ended_at: Some(ended_at),
            error,
        })
    }

    pub fn tool_start(
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
        args: Value,
    ) -> Self {
        Self::Tool(ToolData {
            phase: ToolPhase::Start,
            name: name.into(),
            tool_call_id: tool_call_id.into(),
            args: Some(args),
            partial_result: None,
            result: None,
            is_error: None,
        })
    }

    pub fn tool_result(
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::Tool(ToolData {
            phase: ToolPhase::Result,
            name: name.into(),
            tool_call_id: tool_call_id.into(),
            args: None,
            partial_result: None,
            result: None,
            is_error: Some(is_error),
        })
    }

    pub fn message_delta(text: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::Message(MessageData {
            phase: MessagePhase::Delta,
            text: Some(text.into()),
            delta: Some(delta.into()),
        })
    }

    pub fn compaction_start() -> Self {
        Self::Compaction(CompactionData {
            phase: CompactionPhase::Start,
            will_retry: None,
        })
    }

    pub fn compaction_end(will_retry: bool) -> Self {
        Self::Compaction(CompactionData {
            phase: CompactionPhase::End,
            will_retry: Some(will_retry),
        })
    }
}

/// An event as handed to the bus by a producer, before sequencing.
///
/// Also the shape of a wire frame from an out-of-process producer:
/// `{runId, sessionKey?, stream, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgentEvent {
    pub run_id: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "session_key_wire::deserialize"
    )]
    pub session_key: Option<String>,
    #[serde(flatten)]
    pub payload: AgentEventPayload,
}

impl NewAgentEvent {
    pub fn new(run_id: impl Into<String>, payload: AgentEventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            session_key: None,
            payload,
        }
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }
}

/// A sequenced event record, as delivered to listeners and stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub seq: u64,
    pub ts: i64,
    #[serde(default, with = "session_key_wire")]
    pub session_key: Option<String>,
    #[serde(flatten)]
    pub payload: AgentEventPayload,
}

impl AgentEvent {
    pub fn stream(&self) -> AgentStream {
        self.payload.stream()
    }
}

// ─── Run summaries ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceRunStatus {
    Running,
    Ended,
    Aborted,
    Error,
}

impl TraceRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for TraceRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Ended => write!(f, "ended"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for TraceRunStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "ended" => Ok(Self::Ended),
            "aborted" => Ok(Self::Aborted),
            "error" => Ok(Self::Error),
            _ => Err(anyhow::anyhow!("unknown trace run status: {}", s)),
        }
    }
}

/// Derived summary of one run ("trace meta").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRunMeta {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_run_id: Option<String>,
    #[serde(default, with = "session_key_wire")]
    pub session_key: Option<String>,
    pub status: TraceRunStatus,
    pub tool_calls: u64,
    pub tool_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub first_event_at: i64,
    pub last_event_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceRunMeta {
    pub fn new(run_id: impl Into<String>, first_event_at: i64) -> Self {
        Self {
            run_id: run_id.into(),
            client_run_id: None,
            session_key: None,
            status: TraceRunStatus::Running,
            tool_calls: 0,
            tool_errors: 0,
            started_at: None,
            ended_at: None,
            first_event_at,
            last_event_at: first_event_at,
            error: None,
        }
    }

    /// Fold one event into the summary. Returns false when the run is already
    /// terminal, in which case nothing changes.
    pub fn apply(&mut self, event: &AgentEvent) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.last_event_at = self.last_event_at.max(event.ts);
        if self.session_key.is_none() {
            self.session_key = event.session_key.clone();
        }

        match &event.payload {
            AgentEventPayload::Lifecycle(d) => match d.phase {
                LifecyclePhase::Start => {
                    self.started_at = d.started_at.or(Some(event.ts));
                }
                LifecyclePhase::End => {
                    self.finish(TraceRunStatus::Ended, d.ended_at.unwrap_or(event.ts));
                }
                LifecyclePhase::Error => {
                    self.finish(TraceRunStatus::Error, d.ended_at.unwrap_or(event.ts));
                    self.error = d.error.clone();
                }
                LifecyclePhase::Abort => {
                    self.finish(TraceRunStatus::Aborted, d.ended_at.unwrap_or(event.ts));
                }
            },
            AgentEventPayload::Tool(d) => match d.phase {
                ToolPhase::Start => self.tool_calls += 1,
                ToolPhase::Result if d.is_error == Some(true) => self.tool_errors += 1,
                _ => {}
            },
            AgentEventPayload::Message(_) | AgentEventPayload::Compaction(_) => {}
        }
        true
    }

    fn finish(&mut self, status: TraceRunStatus, ended_at: i64) {
        self.status = status;
        self.ended_at = Some(ended_at);
    }

    /// Sort key for listings: run start, or first sighting if no start was seen.
    pub fn recency(&self) -> i64 {
        self.started_at.unwrap_or(self.first_event_at)
    }
}

/// Orders summaries most recent first, ties broken by run id.
pub fn sort_most_recent_first(runs: &mut [TraceRunMeta]) {
    runs.sort_by(|a, b| {
        b.recency()
            .cmp(&a.recency())
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}

/// Replay page for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRunEvents {
    pub run_id: String,
    pub events: Vec<AgentEvent>,
    pub truncated: bool,
}

impl TraceRunEvents {
    pub fn empty(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: vec![],
            truncated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: u64, payload: AgentEventPayload) -> AgentEvent {
        AgentEvent {
            run_id: "run-1".to_string(),
            seq,
            ts: 1_000 + seq as i64,
            session_key: Some("main".to_string()),
            payload,
        }
    }

    #[test]
    fn event_wire_shape() {
        let evt = event(
            2,
            AgentEventPayload::tool_start("web_fetch", "t1", json!({"url": "https://example.com"})),
        );
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(
            value,
            json!({
                "runId": "run-1",
                "seq": 2,
                "ts": 1002,
                "sessionKey": "main",
                "stream": "tool",
                "data": {
                    "phase": "start",
                    "name": "web_fetch",
                    "toolCallId": "t1",
                    "args": {"url": "https://example.com"}
                }
            })
        );
    }

    #[test]
    fn parses_wire_frame() {
        let frame = json!({
            "runId": "run-9",
            "stream": "compaction",
            "data": {"phase": "end", "willRetry": true}
        });
        let parsed: NewAgentEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(parsed.run_id, "run-9");
        assert_eq!(parsed.session_key, None);
        assert_eq!(parsed.payload, AgentEventPayload::compaction_end(true));
    }

    #[test]
    fn unknown_session_key_is_an_empty_string() {
        let mut evt = event(1, AgentEventPayload::lifecycle_start(900));
        evt.session_key = None;
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["sessionKey"], "");
        let back: AgentEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.session_key, None);

        let meta = TraceRunMeta::new("run-1", 1_000);
        assert_eq!(serde_json::to_value(&meta).unwrap()["sessionKey"], "");

        let frame = json!({"runId": "r", "sessionKey": "", "stream": "compaction", "data": {"phase": "start"}});
        let parsed: NewAgentEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(parsed.session_key, None);
    }

    #[test]
    fn rejects_unknown_stream() {
        let frame = json!({"runId": "run-9", "stream": "telepathy", "data": {}});
        assert!(serde_json::from_value::<NewAgentEvent>(frame).is_err());
    }

    #[test]
    fn stored_record_roundtrips() {
        let evt = event(1, AgentEventPayload::lifecycle_error(5_000, "provider timeout"));
        let json = serde_json::to_string(&evt).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, evt);
        assert_eq!(back.stream(), AgentStream::Lifecycle);
        assert_eq!(back.payload.phase(), "error");
    }

    #[test]
    fn stream_and_status_strings_roundtrip() {
        for stream in [
            AgentStream::Lifecycle,
            AgentStream::Tool,
            AgentStream::Message,
            AgentStream::Compaction,
        ] {
            let parsed: AgentStream = stream.to_string().parse().unwrap();
            assert_eq!(parsed, stream);
        }
        for status in [
            TraceRunStatus::Running,
            TraceRunStatus::Ended,
            TraceRunStatus::Aborted,
            TraceRunStatus::Error,
        ] {
            let parsed: TraceRunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn summary_counts_tools_and_ends() {
        let mut meta = TraceRunMeta::new("run-1", 1_001);
        meta.apply(&event(1, AgentEventPayload::lifecycle_start(900)));
        meta.apply(&event(2, AgentEventPayload::tool_start("web_fetch", "t1", json!({}))));
        meta.apply(&event(3, AgentEventPayload::tool_result("web_fetch", "t1", true)));
        meta.apply(&event(4, AgentEventPayload::tool_start("fs_read", "t2", json!({}))));
        meta.apply(&event(5, AgentEventPayload::tool_result("fs_read", "t2", false)));
        meta.apply(&event(6, AgentEventPayload::lifecycle_end(2_000)));

        assert_eq!(meta.tool_calls, 2);
        assert_eq!(meta.tool_errors, 1);
        assert_eq!(meta.status, TraceRunStatus::Ended);
        assert_eq!(meta.started_at, Some(900));
        assert_eq!(meta.ended_at, Some(2_000));
        assert_eq!(meta.session_key.as_deref(), Some("main"));
    }

    #[test]
    fn terminal_summary_is_frozen() {
        let mut meta = TraceRunMeta::new("run-1", 1_000);
        assert!(meta.apply(&event(1, AgentEventPayload::lifecycle_abort(1_500))));
        assert_eq!(meta.status, TraceRunStatus::Aborted);

        assert!(!meta.apply(&event(2, AgentEventPayload::tool_start("x", "t9", json!({})))));
        assert!(!meta.apply(&event(3, AgentEventPayload::lifecycle_end(3_000))));
        assert_eq!(meta.status, TraceRunStatus::Aborted);
        assert_eq!(meta.tool_calls, 0);
        assert_eq!(meta.ended_at, Some(1_500));
    }

    #[test]
    fn error_phase_keeps_message() {
        let mut meta = TraceRunMeta::new("run-1", 1_000);
        meta.apply(&event(1, AgentEventPayload::lifecycle_error(1_200, "rate limited")));
        assert_eq!(meta.status, TraceRunStatus::Error);
        assert_eq!(meta.error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn most_recent_first_ordering() {
        let mut old = TraceRunMeta::new("a", 100);
        old.started_at = Some(100);
        let newer = TraceRunMeta::new("b", 300);
        let mut tie = TraceRunMeta::new("c", 50);
        tie.started_at = Some(300);

        let mut runs = vec![old, tie, newer];
        sort_most_recent_first(&mut runs);
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }
}
