//! Gateway RPC methods backed by the trace store.
//!
//! - `trace.runs.list` `{limit?}` → `TraceRunMeta[]`
//! - `trace.run.get` `{runId, limit?, afterSeq?}` → `{runId, events, truncated}`

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use bat_types::rpc::{
    RpcErrorCode, RpcRequest, RpcResponse, TraceRunGetParams, TraceRunsListParams,
    TRACE_RUNS_LIST, TRACE_RUN_GET,
};

use crate::query::TraceQuery;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("{0} is unavailable: tracing is disabled")]
    Unavailable(String),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RpcError {
    pub fn code(&self) -> RpcErrorCode {
        match self {
            Self::InvalidParams(_) | Self::Encode(_) => RpcErrorCode::InvalidRequest,
            Self::UnknownMethod(_) => RpcErrorCode::UnknownMethod,
            Self::Unavailable(_) => RpcErrorCode::Unavailable,
        }
    }
}

/// Answer one request. `query` is `None` when tracing is disabled.
pub fn handle_request(query: Option<&TraceQuery>, request: &RpcRequest) -> RpcResponse {
    match call(query, &request.method, &request.params) {
        Ok(payload) => RpcResponse::ok(request.id.clone(), payload),
        Err(e) => RpcResponse::err(request.id.clone(), e.code(), e.to_string()),
    }
}

pub fn call(query: Option<&TraceQuery>, method: &str, params: &Value) -> Result<Value, RpcError> {
    if method != TRACE_RUNS_LIST && method != TRACE_RUN_GET {
        return Err(RpcError::UnknownMethod(method.to_string()));
    }
    let query = query.ok_or_else(|| RpcError::Unavailable(method.to_string()))?;

    if method == TRACE_RUNS_LIST {
        let params: TraceRunsListParams = parse_params(params)?;
        let limit = positive_limit(params.limit)?;
        Ok(serde_json::to_value(query.list_trace_runs(limit))?)
    } else {
        let params: TraceRunGetParams = parse_params(params)?;
        let run_id = params.run_id.trim();
        if run_id.is_empty() {
            return Err(RpcError::InvalidParams("runId must not be empty".to_string()));
        }
        let limit = positive_limit(params.limit)?;
        Ok(serde_json::to_value(query.get_trace_run_events(
            run_id,
            limit,
            params.after_seq,
        ))?)
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, RpcError> {
    let params = if params.is_null() {
        json!({})
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn positive_limit(limit: Option<u32>) -> Result<Option<usize>, RpcError> {
    match limit {
        Some(0) => Err(RpcError::InvalidParams("limit must be at least 1".to_string())),
        other => Ok(other.map(|n| n as usize)),
    }
}
