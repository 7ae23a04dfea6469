//! JSON-RPC 2.0 dispatcher over the Unix control socket.
//!
//! One task per connection, newline-delimited JSON in each direction,
//! strictly sequential within a connection — concurrent connections are
//! isolated from one another, mirroring the per-request-task shape of the
//! teacher's Axum routes but over a raw stream instead of HTTP.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{info, warn};

use bridge_core::audit::{AuditAction, AuditOutcome};
use bridge_core::container::ContainerSpec;
use bridge_core::error::SecurityError;
use bridge_core::keystore::{Credential, Provider};

use crate::error::RpcError;
use crate::state::SharedAppState;

/// An incoming request envelope.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// An outgoing response envelope — exactly one of `result`/`error` is set.
#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn err(id: Value, error: RpcError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

/// Serve one accepted connection until the peer closes it or a malformed
/// line breaks the framing irrecoverably.
pub async fn serve_connection(state: SharedAppState, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "control socket read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&state, &line).await;
        let Ok(mut serialized) = serde_json::to_vec(&response) else {
            warn!("failed to serialize response, dropping connection");
            break;
        };
        serialized.push(b'\n');

        if write_half.write_all(&serialized).await.is_err() {
            break;
        }
    }
}

async fn handle_line(state: &SharedAppState, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return RpcResponse::err(Value::Null, RpcError::new(crate::error::MALFORMED_REQUEST, e.to_string()));
        }
    };

    let id = request.id.unwrap_or(Value::Null);
    match dispatch(state, &request.method, request.params).await {
        Ok(result) => RpcResponse::ok(id, result),
        Err(err) => RpcResponse::err(id, err),
    }
}

async fn dispatch(state: &SharedAppState, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "status" => handle_status(state).await,
        "credential.store" => handle_credential_store(state, params).await,
        "credential.retrieve" => handle_credential_retrieve(state, params).await,
        "credential.list" => handle_credential_list(state, params).await,
        "credential.delete" => handle_credential_delete(state, params).await,
        "session.create" => handle_session_create(state, params).await,
        "session.end" => handle_session_end(state, params).await,
        "token.mint" => handle_token_mint(state, params).await,
        "token.validate" => handle_token_validate(state, params).await,
        "turn.credentials" => handle_turn_credentials(state, params).await,
        "call.start" => handle_call_start(state, params).await,
        "call.answer" => handle_call_answer(state, params).await,
        "call.reject" => handle_call_reject(state, params).await,
        "call.end" => handle_call_end(state, params).await,
        "call.candidates" => handle_call_candidates(state, params).await,
        "budget.record" => handle_budget_record(state, params).await,
        "agent.start" => handle_agent_start(state, params).await,
        other => Err(RpcError::new(crate::error::UNKNOWN_METHOD, format!("unknown method '{other}'"))),
    }
}

// ── param helpers ─────────────────────────────────────────────────────

fn field<'a>(params: &'a Value, name: &str) -> Result<&'a Value, RpcError> {
    params
        .get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| RpcError::invalid_params(format!("missing required field '{name}'")))
}

fn str_field<'a>(params: &'a Value, name: &str) -> Result<&'a str, RpcError> {
    field(params, name)?
        .as_str()
        .ok_or_else(|| RpcError::invalid_params(format!("field '{name}' must be a string")))
}

fn opt_str_field<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

/// Parse a TTL given either as a raw integer number of seconds or a human
/// string like `"10m"`, `"30s"`, `"1h"`.
fn parse_ttl(value: &Value) -> Result<i64, RpcError> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    let Some(s) = value.as_str() else {
        return Err(RpcError::invalid_params("ttl must be an integer or a string like '10m'"));
    };
    let s = s.trim();
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(RpcError::invalid_params(format!("unrecognized ttl unit in '{s}'"))),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| RpcError::invalid_params(format!("invalid ttl value '{s}'")))?;
    Ok(amount.saturating_mul(multiplier))
}

fn provider_from_tag(tag: &str) -> Provider {
    match tag.to_ascii_lowercase().as_str() {
        "openai" => Provider::Openai,
        "anthropic" => Provider::Anthropic,
        "openrouter" => Provider::Openrouter,
        "google" => Provider::Google,
        "xai" => Provider::Xai,
        other => Provider::Other(other.to_owned()),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(crate::error::INTERNAL_STORAGE_IO, e.to_string()))
}

/// Short rule tag for an admission denial, used in the `access_denied` audit
/// record's `detail.rule` field (spec.md §4.6/§8 scenario 4).
fn security_rule(err: &SecurityError) -> String {
    match err {
        SecurityError::ConcurrencyLimit { .. } => "concurrency_limit".to_owned(),
        SecurityError::Blocked { rule } | SecurityError::NotAllowed { rule } => rule.clone(),
        SecurityError::RateLimited { .. } => "rate_limit".to_owned(),
    }
}

/// Run admission control for a new session or call, emitting an
/// `access_denied` audit record on denial before the error reaches the
/// caller (spec.md §4.6: "emits an access_denied audit event with the
/// failing rule").
async fn enforce_admission(state: &SharedAppState, principal: &str, room: &str) -> Result<(), RpcError> {
    if let Err(err) = state.security.check_start(principal, room).await {
        let rule = security_rule(&err);
        let mut detail = serde_json::Map::new();
        detail.insert("room".to_owned(), json!(room));
        detail.insert("rule".to_owned(), json!(rule));
        state.audit.emit(principal, AuditAction::AdmissionDenied, room, AuditOutcome::Denied, detail).await;
        return Err(err.into());
    }
    Ok(())
}

// ── status ────────────────────────────────────────────────────────────

async fn handle_status(state: &SharedAppState) -> Result<Value, RpcError> {
    let uptime_secs = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Ok(json!({
        "keystoreOpen": true,
        "uptimeSecs": uptime_secs,
        "sessions": state.sessions.list().await.len(),
        "activeCalls": state.calls.list().await.len(),
        "budgetSessions": state.budget.list_open().await.len(),
        "auditRecords": state.audit.len().await,
        "auditDropped": state.audit.dropped_count(),
    }))
}

// ── credential.* ──────────────────────────────────────────────────────

async fn handle_credential_store(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let id = str_field(&params, "id")?.to_owned();
    let provider = provider_from_tag(str_field(&params, "provider")?);
    let token = str_field(&params, "token")?.to_owned();
    let display_name = opt_str_field(&params, "displayName").unwrap_or(&id).to_owned();
    let tags = params
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();

    let credential = Credential { id: id.clone(), provider, token, display_name, tags };
    state.keystore.store(&credential).await?;
    Ok(json!({ "id": id }))
}

async fn handle_credential_retrieve(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let id = str_field(&params, "id")?;
    let credential = state.keystore.retrieve(id).await?;

    let mut detail = serde_json::Map::new();
    detail.insert("provider".to_owned(), json!(credential.provider.to_string()));
    state.audit.emit("local", AuditAction::CredentialAccess, id, AuditOutcome::Granted, detail).await;

    to_value(&credential)
}

async fn handle_credential_list(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let provider_filter = opt_str_field(&params, "provider").map(provider_from_tag);
    let list = state.keystore.list(provider_filter).await?;
    to_value(&list)
}

async fn handle_credential_delete(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let id = str_field(&params, "id")?;
    state.keystore.delete(id).await?;
    Ok(json!({ "ok": true }))
}

// ── session.* ─────────────────────────────────────────────────────────

async fn handle_session_create(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let container = str_field(&params, "container")?;
    let room = str_field(&params, "room")?;

    let ttl_secs = match params.get("ttl").filter(|v| !v.is_null()) {
        Some(v) => parse_ttl(v)?,
        None => state.config.budget.default_duration_limit_secs,
    };

    enforce_admission(state, container, room).await?;

    let session = state.sessions.create(container, room, ttl_secs).await?;

    state
        .budget
        .start_session(
            &session.id,
            None,
            room,
            state.config.budget.default_token_limit,
            state.config.budget.default_duration_limit_secs,
        )
        .await;

    let mut detail = serde_json::Map::new();
    detail.insert("container".to_owned(), json!(container));
    state.audit.emit("local", AuditAction::AdmissionGranted, &session.id, AuditOutcome::Granted, detail).await;

    Ok(json!({ "sessionId": session.id, "expiresAt": session.expires_at }))
}

async fn handle_session_end(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let session_id = str_field(&params, "sessionId")?;
    state.sessions.end(session_id).await?;
    state.budget.end_session(session_id).await;
    Ok(json!({ "ok": true }))
}

// ── token.* ───────────────────────────────────────────────────────────

async fn handle_token_mint(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let session_id = str_field(&params, "sessionId")?;
    let token = state.tokens.generate(&state.sessions, session_id).await?;
    Ok(json!({ "token": token.encode() }))
}

async fn handle_token_validate(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let wire = str_field(&params, "token")?;
    let claims = state.tokens.validate(&state.sessions, wire).await?;
    Ok(json!({
        "sid": claims.session_id,
        "rid": claims.room_id,
        "iat": claims.iat,
        "exp": claims.exp,
    }))
}

// ── turn.* ────────────────────────────────────────────────────────────

async fn handle_turn_credentials(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let session_id = str_field(&params, "sessionId")?;
    let ttl = match params.get("ttl").filter(|v| !v.is_null()) {
        Some(v) => Some(parse_ttl(v)?),
        None => None,
    };
    let credential = state.turn.mint(&state.sessions, session_id, ttl).await?;
    to_value(&credential)
}

// ── call.* ────────────────────────────────────────────────────────────

async fn handle_call_start(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let room_id = str_field(&params, "roomId")?;
    let offer_sdp = str_field(&params, "offerSdp")?;
    let principal = str_field(&params, "principal")?;
    // Not in the closed wire table, but the call model requires a distinct
    // callee; callers that know the other party up front may supply it, and
    // a signaling layer can fill it in later via a future extension. Absent
    // that, the callee defaults to the caller, so the only party that can
    // legitimately answer is whoever the daemon already trusts as caller.
    let callee = opt_str_field(&params, "callee").unwrap_or(principal);

    enforce_admission(state, principal, room_id).await?;

    let call = state.calls.start(room_id, principal, callee, offer_sdp).await;
    state.security.register_call(&call.id, principal).await;

    let mut detail = serde_json::Map::new();
    detail.insert("room".to_owned(), json!(room_id));
    state.audit.emit(principal, AuditAction::CallStart, &call.id, AuditOutcome::Granted, detail).await;

    to_value(&call)
}

async fn handle_call_answer(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let call_id = str_field(&params, "callId")?;
    let answer_sdp = str_field(&params, "answerSdp")?;
    let call = state.calls.get(call_id).await?;
    let answerer = opt_str_field(&params, "answerer").unwrap_or(&call.callee);
    state.calls.answer(call_id, answerer, answer_sdp).await?;
    Ok(json!({ "ok": true }))
}

async fn handle_call_reject(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let call_id = str_field(&params, "callId")?;
    state.calls.reject(call_id).await?;
    state.security.unregister_call(call_id).await;
    Ok(json!({ "ok": true }))
}

async fn handle_call_end(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let call_id = str_field(&params, "callId")?;
    let reason = opt_str_field(&params, "reason").unwrap_or("caller requested end");
    state.calls.end(call_id).await?;
    state.security.unregister_call(call_id).await;

    let mut detail = serde_json::Map::new();
    detail.insert("reason".to_owned(), json!(reason));
    state.audit.emit("local", AuditAction::CallEnd, call_id, AuditOutcome::Granted, detail).await;

    Ok(json!({ "ok": true }))
}

async fn handle_call_candidates(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let call_id = str_field(&params, "callId")?;
    let sender = str_field(&params, "sender").unwrap_or_else(|_| "");
    let candidates: Vec<String> = params
        .get("candidates")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();

    let sender = if sender.is_empty() {
        let call = state.calls.get(call_id).await?;
        call.caller
    } else {
        sender.to_owned()
    };

    state.calls.add_candidates(call_id, &sender, candidates).await?;
    Ok(json!({ "ok": true }))
}

// ── budget.* ──────────────────────────────────────────────────────────

async fn handle_budget_record(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let session_id = str_field(&params, "sessionId")?;
    let input = field(&params, "in")?.as_u64().ok_or_else(|| RpcError::invalid_params("'in' must be a non-negative integer"))?;
    let output = field(&params, "out")?.as_u64().ok_or_else(|| RpcError::invalid_params("'out' must be a non-negative integer"))?;
    let model = str_field(&params, "model")?;

    let was_warned = state.budget.get(session_id).await.map(|b| b.warned).unwrap_or(false);

    let result = state.budget.record(session_id, input, output, model).await;

    if let Ok(budget) = state.budget.get(session_id).await {
        if budget.warned && !was_warned {
            let used = budget.input_tokens.saturating_add(budget.output_tokens);
            let mut detail = serde_json::Map::new();
            detail.insert("used".to_owned(), json!(used));
            detail.insert("limit".to_owned(), json!(budget.token_limit));
            state.audit.emit("local", AuditAction::BudgetWarn, session_id, AuditOutcome::Granted, detail).await;
        }
    }

    match result {
        Ok(()) => Ok(json!({ "ok": true })),
        Err(err) => {
            if matches!(err, bridge_core::error::BudgetError::BudgetExceeded { .. }) {
                let mut detail = serde_json::Map::new();
                detail.insert("error".to_owned(), json!(err.to_string()));
                state.audit.emit("local", AuditAction::BudgetStop, session_id, AuditOutcome::Denied, detail).await;

                state.budget.remove(session_id).await;
                let _ = state.sessions.end(session_id).await;
            }
            Err(err.into())
        }
    }
}

// ── agent.* ───────────────────────────────────────────────────────────

async fn handle_agent_start(state: &SharedAppState, params: Value) -> Result<Value, RpcError> {
    let agent_id = str_field(&params, "agentId")?.to_owned();
    let agent_type = str_field(&params, "type")?.to_owned();
    let room_id = str_field(&params, "roomId")?.to_owned();
    let key_id = str_field(&params, "keyId")?.to_owned();
    let capabilities = params
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default();

    let spec = ContainerSpec { agent_id: agent_id.clone(), agent_type, room_id, key_id, capabilities };
    let container_id = state.runtime.create(&spec).await?;

    let mut detail = serde_json::Map::new();
    detail.insert("containerId".to_owned(), json!(container_id));
    state.audit.emit("local", AuditAction::AgentStart, &agent_id, AuditOutcome::Granted, detail).await;
    info!(agent_id, container_id = %container_id, "agent started");

    Ok(json!({ "agentId": agent_id, "containerId": container_id }))
}

/// A handle used only by tests to exercise [`dispatch`] without a socket.
#[cfg(test)]
pub(crate) async fn dispatch_for_test(
    state: &std::sync::Arc<crate::state::AppState>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    dispatch(state, method, params).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;

    async fn test_state() -> Arc<crate::state::AppState> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.keystore.backend = "memory".to_owned();
        config.server.runtime_dir = dir.path().to_path_buf();
        // Keep the dir alive for the duration of the test by leaking it —
        // acceptable in a short-lived unit test process.
        std::mem::forget(dir);
        let (state, _enforcer) = crate::startup::build_app_state(&config).await.unwrap();
        state
    }

    #[test]
    fn parse_ttl_accepts_raw_seconds() {
        assert_eq!(parse_ttl(&json!(42)).unwrap(), 42);
    }

    #[test]
    fn parse_ttl_accepts_human_strings() {
        assert_eq!(parse_ttl(&json!("10m")).unwrap(), 600);
        assert_eq!(parse_ttl(&json!("30s")).unwrap(), 30);
        assert_eq!(parse_ttl(&json!("1h")).unwrap(), 3600);
    }

    #[test]
    fn parse_ttl_rejects_unknown_unit() {
        assert!(parse_ttl(&json!("10x")).is_err());
    }

    #[tokio::test]
    async fn credential_round_trip() {
        let state = test_state().await;
        dispatch_for_test(
            &state,
            "credential.store",
            json!({ "id": "openai-default", "provider": "openai", "token": "sk-abc123" }),
        )
        .await
        .unwrap();

        let retrieved = dispatch_for_test(&state, "credential.retrieve", json!({ "id": "openai-default" }))
            .await
            .unwrap();
        assert_eq!(retrieved["token"], "sk-abc123");

        let list = dispatch_for_test(&state, "credential.list", json!({})).await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert!(list[0].get("token").is_none());
    }

    #[tokio::test]
    async fn session_and_token_round_trip() {
        let state = test_state().await;
        let created = dispatch_for_test(
            &state,
            "session.create",
            json!({ "container": "agent-1", "room": "room-1", "ttl": "10m" }),
        )
        .await
        .unwrap();
        let session_id = created["sessionId"].as_str().unwrap().to_owned();

        let minted = dispatch_for_test(&state, "token.mint", json!({ "sessionId": session_id })).await.unwrap();
        let token = minted["token"].as_str().unwrap().to_owned();

        let validated = dispatch_for_test(&state, "token.validate", json!({ "token": token })).await.unwrap();
        assert_eq!(validated["sid"], session_id);
    }

    #[tokio::test]
    async fn session_create_rejects_zero_ttl() {
        let state = test_state().await;
        let err = dispatch_for_test(
            &state,
            "session.create",
            json!({ "container": "agent-1", "room": "room-1", "ttl": 0 }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, crate::error::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let state = test_state().await;
        let err = dispatch_for_test(&state, "nonsense.method", json!({})).await.unwrap_err();
        assert_eq!(err.code, crate::error::UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn call_lifecycle_rejects_unauthorized_candidates() {
        let state = test_state().await;
        let call = dispatch_for_test(
            &state,
            "call.start",
            json!({ "roomId": "room-1", "offerSdp": "v=0", "principal": "alice" }),
        )
        .await
        .unwrap();
        let call_id = call["id"].as_str().unwrap().to_owned();

        let err = dispatch_for_test(
            &state,
            "call.candidates",
            json!({ "callId": call_id, "sender": "mallory", "candidates": ["cand1"] }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, crate::error::UNAUTHORIZED);
    }
}
