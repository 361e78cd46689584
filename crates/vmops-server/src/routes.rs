use std::convert::Infallible;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use vmops_control_plane::{
    Command, CommandEvent, CommandFamily, CommandStatus, CommandStatusUpdate, CommandType,
    SuccessEnvelope,
};

use crate::auth::Caller;
use crate::commands::delivery::poll_timeout;
use crate::commands::DispatchOutcome;
use crate::error::ApiError;
use crate::provisioning::BootstrapInfo;
use crate::store::ProgressEntry;
use crate::State;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(25);
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

type ApiResult<T> = Result<(StatusCode, Json<SuccessEnvelope<T>>), ApiError>;

fn respond<T>(status: StatusCode, data: T) -> (StatusCode, Json<SuccessEnvelope<T>>) {
    (status, Json(SuccessEnvelope::ok(data)))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        ApiError::bad_request("INVALID_BODY", "request body could not be parsed")
            .with_details(rejection.body_text())
    })
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params.map(|Query(value)| value).map_err(|rejection| {
        ApiError::bad_request("INVALID_QUERY", "query string could not be parsed")
            .with_details(rejection.body_text())
    })
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub agent_id: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    pub expires_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDispatchRequest {
    pub agent_id: String,
    pub command_type: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    pub expires_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NextCommandQuery {
    pub agent_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListCommandsQuery {
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    pub agent_id: Option<String>,
    pub command_id: Option<String>,
    pub last_event_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    pub agent_id: String,
    pub last_seen_at: DateTime<Utc>,
}

// vm-ops commands

fn dispatch_action_impl(
    state: &State,
    caller: &Caller,
    family: CommandFamily,
    action: &str,
    request: DispatchRequest,
) -> Result<DispatchOutcome, ApiError> {
    caller.require_operator()?;
    let command_type = family.action(action).ok_or_else(|| {
        ApiError::bad_request(
            "UNKNOWN_COMMAND_TYPE",
            format!("unknown {} action: {action}", family.as_str()),
        )
    })?;
    state.commands.dispatch_command(
        caller,
        &request.agent_id,
        command_type,
        request.params,
        request.expires_in_seconds.map(Duration::from_secs),
    )
}

pub async fn dispatch_proxmox(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(action): Path<String>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> ApiResult<DispatchOutcome> {
    let outcome =
        dispatch_action_impl(&state, &caller, CommandFamily::Proxmox, &action, body(payload)?)?;
    Ok(respond(StatusCode::ACCEPTED, outcome))
}

pub async fn dispatch_syncthing(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(action): Path<String>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> ApiResult<DispatchOutcome> {
    let outcome =
        dispatch_action_impl(&state, &caller, CommandFamily::Syncthing, &action, body(payload)?)?;
    Ok(respond(StatusCode::ACCEPTED, outcome))
}

fn dispatch_raw_impl(
    state: &State,
    caller: &Caller,
    request: RawDispatchRequest,
) -> Result<DispatchOutcome, ApiError> {
    caller.require_privileged()?;
    let command_type: CommandType = request.command_type.parse().map_err(|err| {
        ApiError::bad_request("UNKNOWN_COMMAND_TYPE", format!("{err}"))
    })?;
    state.commands.dispatch_command(
        caller,
        &request.agent_id,
        command_type,
        request.payload,
        request.expires_in_seconds.map(Duration::from_secs),
    )
}

pub async fn dispatch_command(
    Extension(state): Extension<State>,
    caller: Caller,
    payload: Result<Json<RawDispatchRequest>, JsonRejection>,
) -> ApiResult<DispatchOutcome> {
    let outcome = dispatch_raw_impl(&state, &caller, body(payload)?)?;
    Ok(respond(StatusCode::ACCEPTED, outcome))
}

async fn next_command_impl(
    state: &State,
    caller: &Caller,
    params: NextCommandQuery,
) -> Result<Option<Command>, ApiError> {
    let agent_id = caller.require_agent()?;
    if let Some(requested) = params.agent_id.as_deref() {
        if requested != agent_id {
            return Err(ApiError::forbidden(
                "AGENT_MISMATCH",
                "agents may only poll for their own commands",
            ));
        }
    }
    let timeout = poll_timeout(params.timeout_ms);
    debug!(agent_id, timeout_ms = timeout.as_millis() as u64, "long-poll");
    state
        .commands
        .wait_for_next_agent_command(&caller.tenant_id, agent_id, timeout)
        .await
}

pub async fn next_command(
    Extension(state): Extension<State>,
    caller: Caller,
    params: Result<Query<NextCommandQuery>, QueryRejection>,
) -> ApiResult<Option<Command>> {
    let command = next_command_impl(&state, &caller, query(params)?).await?;
    Ok(respond(StatusCode::OK, command))
}

pub async fn update_command(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(command_id): Path<String>,
    payload: Result<Json<CommandStatusUpdate>, JsonRejection>,
) -> ApiResult<Command> {
    let update = body(payload)?;
    let agent_id = caller.require_agent()?;
    let command =
        state
            .commands
            .update_command_status(&caller.tenant_id, agent_id, &command_id, update)?;
    Ok(respond(StatusCode::OK, command))
}

pub async fn get_command(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(command_id): Path<String>,
) -> ApiResult<Command> {
    let command = state.commands.get_command_status(&caller, &command_id)?;
    Ok(respond(StatusCode::OK, command))
}

fn list_commands_impl(
    state: &State,
    caller: &Caller,
    params: ListCommandsQuery,
) -> Result<Vec<Command>, ApiError> {
    let agent_id = params
        .agent_id
        .as_deref()
        .or_else(|| caller.agent_id())
        .ok_or_else(|| ApiError::bad_request("AGENT_ID_REQUIRED", "agent_id is required"))?;
    let status = params
        .status
        .as_deref()
        .map(|raw| {
            CommandStatus::parse(raw).ok_or_else(|| {
                ApiError::bad_request("INVALID_STATUS", format!("unknown status: {raw}"))
            })
        })
        .transpose()?;
    state
        .commands
        .list_agent_commands(caller, agent_id, status, params.limit)
}

pub async fn list_commands(
    Extension(state): Extension<State>,
    caller: Caller,
    params: Result<Query<ListCommandsQuery>, QueryRejection>,
) -> ApiResult<Vec<Command>> {
    let commands = list_commands_impl(&state, &caller, query(params)?)?;
    Ok(respond(StatusCode::OK, commands))
}

pub async fn agent_heartbeat(
    Extension(state): Extension<State>,
    caller: Caller,
) -> ApiResult<HeartbeatResponse> {
    let agent_id = caller.require_agent()?;
    let last_seen_at = state.commands.record_heartbeat(&caller.tenant_id, agent_id)?;
    Ok(respond(
        StatusCode::OK,
        HeartbeatResponse {
            agent_id: agent_id.to_string(),
            last_seen_at,
        },
    ))
}

fn sse_event(event: &CommandEvent) -> Result<Event, serde_json::Error> {
    Event::default()
        .id(event.id.to_string())
        .event(event.event_type.as_str())
        .json_data(event)
}

pub async fn command_events(
    Extension(state): Extension<State>,
    caller: Caller,
    headers: HeaderMap,
    params: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, serde_json::Error>>>, ApiError> {
    let params = query(params)?;
    let filter = state.commands.observer_filter(
        &caller,
        params.agent_id.as_deref(),
        params.command_id.as_deref(),
    )?;
    let last_event_id = params.last_event_id.or_else(|| {
        headers
            .get(LAST_EVENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    });

    let (replay, mut subscription) = match last_event_id {
        Some(last_event_id) => state.bus.subscribe_with_replay(filter, last_event_id),
        None => (Vec::new(), state.bus.subscribe(filter)),
    };
    info!(
        tenant_id = %caller.tenant_id,
        user_id = %caller.user_id,
        replayed = replay.len(),
        subscribers = state.bus.subscriber_count(),
        "event stream opened"
    );

    let connected = json!({
        "tenant_id": caller.tenant_id,
        "last_event_id": state.bus.last_event_id(),
    });
    let stream = async_stream::stream! {
        yield Event::default().event("connected").json_data(connected);
        for event in replay {
            yield sse_event(&event);
        }
        while let Some(event) = subscription.recv().await {
            yield sse_event(&event);
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

// provisioning

#[derive(Debug, Clone, Deserialize)]
pub struct IssueProvisioningRequest {
    pub vm_uuid: String,
    pub expires_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedProvisioningToken {
    pub vm_uuid: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceTokenRequest {
    pub token: String,
    pub vm_uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportProgressRequest {
    pub token: String,
    pub vm_uuid: String,
    pub step: String,
    pub status: String,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidatedDevice {
    pub valid: bool,
    pub bootstrap: BootstrapInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct Revoked {
    pub revoked: bool,
}

pub async fn issue_provisioning_token(
    Extension(state): Extension<State>,
    caller: Caller,
    payload: Result<Json<IssueProvisioningRequest>, JsonRejection>,
) -> ApiResult<IssuedProvisioningToken> {
    let request = body(payload)?;
    caller.require_operator()?;
    let issued = state.provisioning.issue_token(
        &caller.tenant_id,
        &caller.user_id,
        &request.vm_uuid,
        request.expires_in_seconds.map(Duration::from_secs),
    )?;
    Ok(respond(
        StatusCode::CREATED,
        IssuedProvisioningToken {
            vm_uuid: issued.grant.principal_id,
            token: issued.token,
            expires_at: issued.grant.expires_at,
        },
    ))
}

pub async fn revoke_provisioning_token(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(vm_uuid): Path<String>,
) -> ApiResult<Revoked> {
    caller.require_operator()?;
    let revoked = state
        .provisioning
        .revoke_by_device(&caller.tenant_id, &vm_uuid)?;
    Ok(respond(StatusCode::OK, Revoked { revoked }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevokeTokenRequest {
    pub token: String,
}

pub async fn revoke_provisioning_token_by_value(
    Extension(state): Extension<State>,
    caller: Caller,
    payload: Result<Json<RevokeTokenRequest>, JsonRejection>,
) -> ApiResult<Revoked> {
    let request = body(payload)?;
    caller.require_operator()?;
    let revoked = state.provisioning.revoke_token(&request.token)?;
    Ok(respond(StatusCode::OK, Revoked { revoked }))
}

pub async fn validate_provisioning_token(
    Extension(state): Extension<State>,
    payload: Result<Json<DeviceTokenRequest>, JsonRejection>,
) -> ApiResult<ValidatedDevice> {
    let request = body(payload)?;
    let grant = state
        .provisioning
        .validate_token(&request.token, &request.vm_uuid)
        .into_result()?;
    Ok(respond(
        StatusCode::OK,
        ValidatedDevice {
            valid: true,
            bootstrap: state.provisioning.bootstrap(&grant),
        },
    ))
}

pub async fn report_progress(
    Extension(state): Extension<State>,
    payload: Result<Json<ReportProgressRequest>, JsonRejection>,
) -> ApiResult<ProgressEntry> {
    let request = body(payload)?;
    let entry = state.provisioning.report_progress(
        &request.token,
        &request.vm_uuid,
        &request.step,
        &request.status,
        request.details,
    )?;
    Ok(respond(StatusCode::CREATED, entry))
}

pub async fn complete_provisioning(
    Extension(state): Extension<State>,
    payload: Result<Json<DeviceTokenRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let request = body(payload)?;
    let grant = state
        .provisioning
        .mark_used(&request.token, &request.vm_uuid)?;
    Ok(respond(
        StatusCode::OK,
        json!({ "vm_uuid": grant.principal_id, "status": grant.status }),
    ))
}

pub async fn provisioning_progress(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(vm_uuid): Path<String>,
) -> ApiResult<Vec<ProgressEntry>> {
    caller.require_operator()?;
    let entries = state.provisioning.get_progress(&caller.tenant_id, &vm_uuid)?;
    Ok(respond(StatusCode::OK, entries))
}

// leases

#[derive(Debug, Clone, Deserialize)]
pub struct IssueLeaseRequest {
    pub capability: String,
    pub expires_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedLease {
    pub lease_id: String,
    pub token: String,
    pub capability: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseHeartbeatRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseHeartbeat {
    pub lease_id: String,
    /// Replaces the token presented with the heartbeat.
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

pub async fn issue_lease(
    Extension(state): Extension<State>,
    caller: Caller,
    payload: Result<Json<IssueLeaseRequest>, JsonRejection>,
) -> ApiResult<IssuedLease> {
    let request = body(payload)?;
    let issued = state.leases.issue_lease(
        &caller.tenant_id,
        &caller.user_id,
        &request.capability,
        request.expires_in_seconds.map(Duration::from_secs),
    )?;
    Ok(respond(
        StatusCode::CREATED,
        IssuedLease {
            lease_id: issued.grant.principal_id,
            token: issued.token,
            capability: request.capability,
            expires_at: issued.grant.expires_at,
        },
    ))
}

pub async fn lease_heartbeat(
    Extension(state): Extension<State>,
    payload: Result<Json<LeaseHeartbeatRequest>, JsonRejection>,
) -> ApiResult<LeaseHeartbeat> {
    let request = body(payload)?;
    let renewed = state.leases.heartbeat(&request.token)?;
    Ok(respond(
        StatusCode::OK,
        LeaseHeartbeat {
            lease_id: renewed.grant.principal_id,
            token: renewed.token,
            expires_at: renewed.grant.expires_at,
            last_heartbeat_at: renewed.grant.last_heartbeat_at,
        },
    ))
}

fn revoke_lease_impl(state: &State, caller: &Caller, lease_id: &str) -> Result<bool, ApiError> {
    let lease = state
        .leases
        .find_lease(&caller.tenant_id, lease_id)?
        .ok_or_else(|| ApiError::not_found("LEASE_NOT_FOUND", format!("lease {lease_id} not found")))?;
    if lease.user_id != caller.user_id && !caller.is_privileged() {
        return Err(ApiError::forbidden(
            "LEASE_FORBIDDEN",
            "only the lease holder may revoke it",
        ));
    }
    state.leases.revoke_lease(&caller.tenant_id, lease_id)
}

pub async fn revoke_lease(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(lease_id): Path<String>,
) -> ApiResult<Revoked> {
    let revoked = revoke_lease_impl(&state, &caller, &lease_id)?;
    Ok(respond(StatusCode::OK, Revoked { revoked }))
}

pub async fn health_check(
    Extension(state): Extension<State>,
) -> Result<Json<SuccessEnvelope<Value>>, Infallible> {
    Ok(Json(SuccessEnvelope::ok(json!({
        "status": "ok",
        "store": state.store.backend().as_str(),
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ADMIN_ROLE, AGENT_ROLE};
    use crate::commands::tests::{seeded_store, AGENT, OWNER, TENANT};
    use crate::config::ServerConfig;
    use crate::store::{MemoryStore, SubscriptionStatus};
    use crate::token::{self, Claims, ACCESS_TOKEN_TYPE};
    use axum::body::Body;
    use axum::http::{header, Method, Request, Response};
    use axum::Router;
    use hyper::body::HttpBody;
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "router-secret";

    fn app_with(store: Arc<MemoryStore>) -> Router {
        crate::app(State::new(store, &ServerConfig::for_tests(SECRET)))
    }

    fn access_token(user: &str, roles: &[&str]) -> String {
        token::sign(
            Claims::new(ACCESS_TOKEN_TYPE, user, TENANT).with_roles(roles.iter().copied()),
            SECRET.as_bytes(),
            Duration::from_secs(600),
        )
    }

    fn operator() -> String {
        access_token(OWNER, &[])
    }

    fn agent() -> String {
        access_token(AGENT, &[AGENT_ROLE])
    }

    fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(bearer) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn read_until(response: &mut Response<axum::body::BoxBody>, needle: &str) -> String {
        let mut seen = String::new();
        let body = response.body_mut();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.data())
                .await
                .expect("event arrives")
                .expect("stream open")
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    fn start_body() -> Value {
        json!({ "agent_id": AGENT, "params": { "node": "pve1", "vmid": 101 } })
    }

    #[tokio::test]
    async fn health_check_reports_store() {
        let app = app_with(seeded_store());
        let (status, body) = call(&app, request(Method::GET, "/health-check", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["store"], "memory");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = app_with(seeded_store());
        let (status, body) = call(&app, request(Method::GET, "/nope", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "ROUTE_NOT_FOUND");
    }

    #[tokio::test]
    async fn vm_ops_requires_bearer_token() {
        let app = app_with(seeded_store());
        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/start", None, Some(start_body())),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "MISSING_TOKEN");

        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/start", Some("garbage"), Some(start_body())),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_action_agents_and_bad_bodies() {
        let app = app_with(seeded_store());
        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/explode", Some(&operator()), Some(start_body())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "UNKNOWN_COMMAND_TYPE");

        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/start", Some(&agent()), Some(start_body())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "OPERATOR_ONLY");

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/vm-ops/proxmox/start",
                Some(&operator()),
                Some(json!({ "params": {} })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_BODY");
    }

    #[tokio::test]
    async fn raw_dispatch_is_admin_only() {
        let app = app_with(seeded_store());
        let raw = json!({
            "agent_id": AGENT,
            "command_type": "syncthing.rescan",
            "payload": { "folder_id": "docs" },
        });
        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/commands", Some(&operator()), Some(raw.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "PRIVILEGED_ONLY");

        let admin = access_token("root", &[ADMIN_ROLE]);
        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/commands", Some(&admin), Some(raw)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["command"]["command_type"], "syncthing.rescan");

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/vm-ops/commands",
                Some(&admin),
                Some(json!({ "agent_id": AGENT, "command_type": "shell.exec" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "UNKNOWN_COMMAND_TYPE");
    }

    #[tokio::test]
    async fn read_only_dispatch_is_deduplicated_over_http() {
        let app = app_with(seeded_store());
        let status_body = json!({ "agent_id": AGENT, "params": { "node": "pve1", "vmid": 7 } });
        let (_, first) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/status", Some(&operator()), Some(status_body.clone())),
        )
        .await;
        let (status, second) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/status", Some(&operator()), Some(status_body)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(second["data"]["deduplicated"], true);
        assert_eq!(first["data"]["command"]["id"], second["data"]["command"]["id"]);
    }

    #[tokio::test]
    async fn long_poll_times_out_with_null() {
        let app = app_with(seeded_store());
        let started = std::time::Instant::now();
        let (status, body) = call(
            &app,
            request(
                Method::GET,
                &format!("/vm-ops/commands/next?agent_id={AGENT}&timeout_ms=1000"),
                Some(&agent()),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].is_null());
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn long_poll_rejects_other_agents_and_operators() {
        let app = app_with(seeded_store());
        let (status, body) = call(
            &app,
            request(Method::GET, "/vm-ops/commands/next?agent_id=agent-2", Some(&agent()), None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AGENT_MISMATCH");

        let (status, body) = call(
            &app,
            request(Method::GET, "/vm-ops/commands/next", Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AGENT_ONLY");
    }

    #[tokio::test]
    async fn list_commands_validates_status_and_scopes_agents() {
        let app = app_with(seeded_store());
        call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/start", Some(&operator()), Some(start_body())),
        )
        .await;

        let (status, body) = call(
            &app,
            request(Method::GET, "/vm-ops/commands?status=queued", Some(&agent()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

        let (status, body) = call(
            &app,
            request(
                Method::GET,
                &format!("/vm-ops/commands?agent_id={AGENT}&status=paused"),
                Some(&operator()),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_STATUS");

        let (status, body) = call(
            &app,
            request(Method::GET, "/vm-ops/commands", Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "AGENT_ID_REQUIRED");
    }

    #[tokio::test]
    async fn agent_heartbeat_updates_last_seen() {
        let app = app_with(seeded_store());
        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/agents/heartbeat", Some(&agent()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["agent_id"], AGENT);
    }

    #[tokio::test]
    async fn event_stream_requires_an_owned_agent() {
        let app = app_with(seeded_store());
        let (status, body) = call(
            &app,
            request(Method::GET, "/vm-ops/events", Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "AGENT_ID_REQUIRED");

        let stranger = access_token("user-2", &[]);
        let (status, _) = call(
            &app,
            request(
                Method::GET,
                &format!("/vm-ops/events?agent_id={AGENT}"),
                Some(&stranger),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn event_stream_replays_after_last_event_id_header() {
        let app = app_with(seeded_store());
        let (_, first) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/start", Some(&operator()), Some(start_body())),
        )
        .await;
        let (_, second) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/stop", Some(&operator()), Some(start_body())),
        )
        .await;

        let mut events = request(
            Method::GET,
            &format!("/vm-ops/events?agent_id={AGENT}"),
            Some(&operator()),
            None,
        );
        events
            .headers_mut()
            .insert(LAST_EVENT_ID_HEADER, "1".parse().unwrap());
        let mut response = app.clone().oneshot(events).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let second_id = second["data"]["command"]["id"].as_str().unwrap().to_string();
        let seen = read_until(&mut response, &second_id).await;
        assert!(seen.contains("event:connected"));
        assert!(seen.contains("id:2"));
        assert!(!seen.contains(first["data"]["command"]["id"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn dispatch_poll_run_succeed_scenario() {
        let app = app_with(seeded_store());

        let (status, body) = call(
            &app,
            request(Method::POST, "/vm-ops/proxmox/start", Some(&operator()), Some(start_body())),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["command"]["status"], "queued");
        assert_eq!(body["data"]["deduplicated"], false);
        let command_id = body["data"]["command"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            request(Method::GET, "/vm-ops/commands/next?timeout_ms=1000", Some(&agent()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], command_id.as_str());

        let mut observer = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/vm-ops/events?agent_id={AGENT}&command_id={command_id}"),
                Some(&operator()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(observer.status(), StatusCode::OK);
        read_until(&mut observer, "event:connected").await;

        let patch = |status: &str| {
            request(
                Method::PATCH,
                &format!("/vm-ops/commands/{command_id}"),
                Some(&agent()),
                Some(json!({ "status": status, "result": { "ok": true } })),
            )
        };
        let (status, body) = call(&app, patch("running")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "running");
        read_until(&mut observer, "event:command.running").await;

        let (status, body) = call(&app, patch("succeeded")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "succeeded");
        assert_eq!(body["data"]["result"]["ok"], true);
        read_until(&mut observer, "event:command.succeeded").await;

        let (status, body) = call(&app, patch("failed")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

        let (status, body) = call(
            &app,
            request(
                Method::GET,
                &format!("/vm-ops/commands/{command_id}"),
                Some(&operator()),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "succeeded");
    }

    #[tokio::test]
    async fn provisioning_flow_over_http() {
        let store = seeded_store();
        store.set_subscription(TENANT, OWNER, SubscriptionStatus::Active);
        let app = app_with(store);

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/tokens",
                Some(&operator()),
                Some(json!({ "vm_uuid": "vm-9" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let device_token = body["data"]["token"].as_str().unwrap().to_string();
        let device = json!({ "token": device_token, "vm_uuid": "vm-9" });

        let (status, body) = call(
            &app,
            request(Method::POST, "/provisioning/validate-token", None, Some(device.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], true);
        assert_eq!(
            body["data"]["bootstrap"]["complete_url"],
            "http://vmops.test/provisioning/complete"
        );

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/validate-token",
                None,
                Some(json!({ "token": device_token, "vm_uuid": "vm-other" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["details"], "principal_mismatch");

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/report-progress",
                None,
                Some(json!({
                    "token": device_token,
                    "vm_uuid": "vm-9",
                    "step": "packages",
                    "status": "done",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["step"], "packages");

        let (status, _) = call(
            &app,
            request(Method::POST, "/provisioning/complete", None, Some(device.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            request(Method::POST, "/provisioning/complete", None, Some(device)),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["details"], "used");

        let (status, body) = call(
            &app,
            request(Method::GET, "/provisioning/progress/vm-9", Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn revoked_provisioning_token_is_rejected() {
        let store = seeded_store();
        store.set_subscription(TENANT, OWNER, SubscriptionStatus::Active);
        let app = app_with(store);
        let (_, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/tokens",
                Some(&operator()),
                Some(json!({ "vm_uuid": "vm-3" })),
            ),
        )
        .await;
        let device_token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            request(Method::DELETE, "/provisioning/tokens/vm-3", Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["revoked"], true);

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/validate-token",
                None,
                Some(json!({ "token": device_token, "vm_uuid": "vm-3" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["details"], "revoked");

        let (_, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/tokens",
                Some(&operator()),
                Some(json!({ "vm_uuid": "vm-4" })),
            ),
        )
        .await;
        let device_token = body["data"]["token"].as_str().unwrap().to_string();
        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/revoke-token",
                Some(&operator()),
                Some(json!({ "token": device_token })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["revoked"], true);

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/provisioning/revoke-token",
                Some(&operator()),
                Some(json!({ "token": "not-a-token" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["details"], "malformed");
    }

    #[tokio::test]
    async fn lease_issue_heartbeat_and_revoke() {
        let app = app_with(seeded_store());
        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/leases",
                Some(&operator()),
                Some(json!({ "capability": "console", "expires_in_seconds": 120 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["capability"], "console");
        let lease_id = body["data"]["lease_id"].as_str().unwrap().to_string();
        let lease_token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/leases/heartbeat",
                None,
                Some(json!({ "token": lease_token })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["lease_id"], lease_id.as_str());
        let renewed_token = body["data"]["token"].as_str().unwrap().to_string();
        assert_ne!(renewed_token, lease_token);

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/leases/heartbeat",
                None,
                Some(json!({ "token": lease_token })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["details"], "superseded");

        let stranger = access_token("user-2", &[]);
        let (status, body) = call(
            &app,
            request(Method::DELETE, &format!("/leases/{lease_id}"), Some(&stranger), None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "LEASE_FORBIDDEN");

        let (status, _) = call(
            &app,
            request(Method::DELETE, &format!("/leases/{lease_id}"), Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            request(
                Method::POST,
                "/leases/heartbeat",
                None,
                Some(json!({ "token": renewed_token })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["details"], "revoked");

        let (status, body) = call(
            &app,
            request(Method::DELETE, "/leases/lease-missing", Some(&operator()), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "LEASE_NOT_FOUND");
    }
}
