//! HTTP handlers.

use crate::error::{ApiError, ApiResult};
use crate::server::{AppState, REGISTRY_TOPIC};
use crate::ws::{handle_topic_stream, publish_options};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use intercom_broker::PublishOptions;
use intercom_core::{
    AssignTaskRequest, AssignTaskResponse, CompleteTaskRequest, DiscoverQuery, Error,
    FailTaskRequest, Priority, PublishRequest, PublishResponse, RegisterRequest, ServiceInstance,
    Task, Topic,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

type AppStateRef = State<Arc<AppState>>;

pub async fn health(State(state): AppStateRef) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "instances": state.registry.len(),
        "topics": state.broker.topics().len(),
        "active_tasks": state.orchestrator.active().len(),
    }))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub async fn list_services(
    State(state): AppStateRef,
    query: Result<Query<DiscoverQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let instances = state.registry.all(query.healthy_only.unwrap_or(false));
    Ok(Json(json!({
        "services": state.registry.services(),
        "instances": instances,
    })))
}

/// Instances of one service. Healthy ones only unless `healthy_only=false`.
pub async fn discover(
    State(state): AppStateRef,
    Path(name): Path<String>,
    query: Result<Query<DiscoverQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ServiceInstance>>> {
    let Query(query) = query?;
    Ok(Json(
        state
            .registry
            .discover(&name, query.healthy_only.unwrap_or(true)),
    ))
}

pub async fn register(
    State(state): AppStateRef,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ServiceInstance>)> {
    let Json(req) = body?;
    let instance = state.registry.register(
        &req.service_name,
        &req.instance_id,
        &req.host,
        req.port,
        req.metadata,
    )?;
    announce(&state, "registered", &instance.service_name, &instance.instance_id);
    state.orchestrator.dispatch_pending();
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn deregister(
    State(state): AppStateRef,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if !state.registry.deregister(&name, &id) {
        return Err(Error::instance_not_found(name, id).into());
    }
    announce(&state, "deregistered", &name, &id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn heartbeat(
    State(state): AppStateRef,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    if !state.registry.heartbeat(&name, &id) {
        return Err(Error::instance_not_found(name, id).into());
    }
    // A stale instance that heartbeats again may pick up queued work.
    state.orchestrator.dispatch_pending();
    Ok(Json(json!({ "ok": true })))
}

/// Membership changes go out on the registry topic at low priority.
fn announce(state: &AppState, event: &str, service: &str, instance_id: &str) {
    state.broker.publish(
        REGISTRY_TOPIC,
        json!({ "event": event, "service": service, "instance_id": instance_id }),
        PublishOptions::default()
            .priority(Priority::Low)
            .sender("intercom"),
    );
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub async fn publish(
    State(state): AppStateRef,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<Json<PublishResponse>> {
    let Json(req) = body?;
    if req.topic.is_empty() {
        return Err(Error::invalid_request("topic must be non-empty").into());
    }
    let options = publish_options(&req)?;
    let id = state.broker.publish(req.topic.as_str(), req.payload, options);
    Ok(Json(PublishResponse { id }))
}

pub async fn topics(State(state): AppStateRef) -> Json<Value> {
    let topics: Vec<Value> = state
        .broker
        .topics()
        .iter()
        .map(|topic| {
            json!({
                "topic": topic,
                "subscribers": state.broker.subscriber_count(topic.as_str()),
                "queue_depth": state.broker.queue_depth(topic.as_str()),
            })
        })
        .collect();
    Json(json!({
        "topics": topics,
        "stats": state.broker.stats(),
    }))
}

pub async fn topic_ws(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): AppStateRef,
) -> impl IntoResponse {
    let topic = Topic::new(topic);
    ws.on_upgrade(move |socket| handle_topic_stream(socket, topic, state))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// 201 when the task went straight to an instance, 202 when it was queued.
pub async fn assign_task(
    State(state): AppStateRef,
    body: Result<Json<AssignTaskRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AssignTaskResponse>)> {
    let Json(req) = body?;
    let task_id = req
        .task_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let assigned = state.orchestrator.assign_task(
        &task_id,
        &req.task_type,
        req.payload,
        req.preferred_instance.as_deref(),
    )?;
    let status = if assigned.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(AssignTaskResponse {
            task_id,
            assigned_instance: assigned,
        }),
    ))
}

pub async fn get_task(
    State(state): AppStateRef,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    state
        .orchestrator
        .task(&task_id)
        .map(Json)
        .ok_or_else(|| Error::TaskNotFound(task_id).into())
}

pub async fn list_tasks(State(state): AppStateRef) -> Json<Value> {
    Json(json!({
        "active": state.orchestrator.active(),
        "pending": state.orchestrator.pending(),
        "history": state.orchestrator.history(),
    }))
}

pub async fn complete_task(
    State(state): AppStateRef,
    Path(task_id): Path<String>,
    body: Result<Json<CompleteTaskRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body?;
    let done = state
        .orchestrator
        .complete_task(&req.instance_id, &task_id, req.result)?;
    finished(done, &task_id, &req.instance_id)
}

pub async fn fail_task(
    State(state): AppStateRef,
    Path(task_id): Path<String>,
    body: Result<Json<FailTaskRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body?;
    let done = state
        .orchestrator
        .fail_task(&req.instance_id, &task_id, &req.error)?;
    finished(done, &task_id, &req.instance_id)
}

fn finished(done: bool, task_id: &str, instance_id: &str) -> ApiResult<Json<Value>> {
    if !done {
        return Err(ApiError::Conflict(format!(
            "task {} is not assigned to {}",
            task_id, instance_id
        )));
    }
    info!("Task {} reported by {}", task_id, instance_id);
    Ok(Json(json!({ "ok": true })))
}
