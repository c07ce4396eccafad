// Memory Protocol surface: JSON-RPC 2.0 dispatch at POST /mcp plus the push
// registration endpoints. Domain errors map to positive application codes;
// -32601/-32602 cover unknown methods and malformed params.

use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use log::debug;
use memoro_core::error::Error;
use memoro_core::push::PushRegistration;
use memoro_core::rpc::types::{INVALID_PARAMS, METHOD_NOT_FOUND};
use memoro_core::store::ChunkRow;
use memoro_core::types::{Event, EventType, Task};
use memoro_core::bus::{TOPIC_MEMORY, TOPIC_TASKS};
use serde_json::{json, Value};

/// Application-level JSON-RPC error codes (positive range).
fn domain_code(error: &Error) -> i64 {
    match error.kind() {
        "validation" => 1001,
        "not_found" => 1002,
        "invalid_transition" => 1003,
        "conflict" => 1004,
        _ => 1500,
    }
}

pub async fn mcp_handler(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let params = request["params"].clone();
    debug!("[mcp] {} (operation={})", method, params["operation"].as_str().unwrap_or("-"));

    let outcome = dispatch(&state, &method, &params);
    let response = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }),
    };
    Json(response)
}

fn dispatch(state: &AppState, method: &str, params: &Value) -> Result<Value, (i64, String)> {
    let operation = params["operation"].as_str().unwrap_or_default();
    let options = &params["options"];
    match (method, operation) {
        ("memory_create", "store_chunk") | ("memory_create", "store_decision") => {
            store_chunk(state, operation, options)
        }
        ("memory_read", "search") | ("memory_read", "find_similar") => search(state, options),
        ("memory_read", "get_chunk") => get_chunk(state, options),
        ("memory_update", "update_thread") => update_thread(state, options),
        ("memory_tasks", "todo_read") => todo_read(state, options),
        ("memory_tasks", "todo_write") => todo_write(state, options),
        ("memory_tasks", "todo_update") => todo_update(state, options),
        ("memory_system", "health") => Ok(json!({
            "status": "ok",
            "connections": state.hub.connection_count(),
            "push_endpoints": state.push.endpoints().len(),
        })),
        ("memory_create", _) | ("memory_read", _) | ("memory_update", _)
        | ("memory_tasks", _) | ("memory_system", _) => Err((
            INVALID_PARAMS,
            format!("unknown operation '{}' for {}", operation, method),
        )),
        _ => Err((METHOD_NOT_FOUND, format!("method '{}' not found", method))),
    }
}

fn required_str<'a>(options: &'a Value, key: &str) -> Result<&'a str, (i64, String)> {
    options[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| (INVALID_PARAMS, format!("missing option '{}'", key)))
}

fn store_chunk(state: &AppState, operation: &str, options: &Value) -> Result<Value, (i64, String)> {
    let repository = required_str(options, "repository")?;
    let content = required_str(options, "content")?;
    let chunk_type = options["type"]
        .as_str()
        .unwrap_or(if operation == "store_decision" { "decision" } else { "chunk" });
    let metadata = options.get("metadata").cloned().unwrap_or_else(|| json!({}));

    let chunk_id = state
        .store
        .insert_chunk(repository, content, chunk_type, &metadata)
        .map_err(|e| (domain_code(&e), e.to_string()))?;

    state.bus.publish(
        TOPIC_MEMORY,
        Event::new(
            EventType::MemoryCreated,
            Some(repository.to_string()),
            json!({"chunk_id": chunk_id, "type": chunk_type}),
        ),
    );
    Ok(json!({"chunk_id": chunk_id}))
}

fn chunk_json(chunk: &ChunkRow) -> Value {
    json!({
        "chunk_id": chunk.chunk_id,
        "repository": chunk.repository,
        "content": chunk.content,
        "type": chunk.chunk_type,
        "metadata": chunk.metadata,
    })
}

fn search(state: &AppState, options: &Value) -> Result<Value, (i64, String)> {
    let repository = required_str(options, "repository")?;
    let query = required_str(options, "query")?;
    let limit = options["limit"].as_u64().unwrap_or(10) as u32;
    let chunks = state
        .store
        .search_chunks(repository, query, limit)
        .map_err(|e| (domain_code(&e), e.to_string()))?;
    Ok(json!({"chunks": chunks.iter().map(chunk_json).collect::<Vec<_>>()}))
}

fn get_chunk(state: &AppState, options: &Value) -> Result<Value, (i64, String)> {
    let chunk_id = required_str(options, "chunk_id")?;
    let chunk = state
        .store
        .get_chunk(chunk_id)
        .map_err(|e| (domain_code(&e), e.to_string()))?;
    Ok(chunk_json(&chunk))
}

fn update_thread(state: &AppState, options: &Value) -> Result<Value, (i64, String)> {
    let thread_id = required_str(options, "thread_id")?;
    let metadata = options.get("metadata").cloned().unwrap_or_else(|| json!({}));
    state
        .store
        .update_chunk_metadata(thread_id, &metadata)
        .map_err(|e| (domain_code(&e), e.to_string()))?;
    let repository = state.store.get_chunk(thread_id).ok().map(|c| c.repository);
    state.bus.publish(
        TOPIC_MEMORY,
        Event::new(EventType::MemoryUpdated, repository, json!({"chunk_id": thread_id})),
    );
    Ok(json!({"ok": true}))
}

/// Opaque sync cursors encode the watermark time.
fn encode_token(at: DateTime<Utc>) -> String {
    format!("t:{}", at.to_rfc3339())
}

fn decode_token(token: &str) -> Option<DateTime<Utc>> {
    token
        .strip_prefix("t:")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn todo_read(state: &AppState, options: &Value) -> Result<Value, (i64, String)> {
    let repository = required_str(options, "repository")?;
    let since = options["since_token"].as_str().and_then(decode_token);

    let filter = memoro_core::store::TaskFilter {
        repository: Some(repository.to_string()),
        ..Default::default()
    };
    let tasks = state
        .store
        .list_tasks(&filter)
        .map_err(|e| (domain_code(&e), e.to_string()))?;
    let changed: Vec<&Task> = match since {
        Some(cursor) => tasks.iter().filter(|t| t.updated_at > cursor).collect(),
        None => tasks.iter().collect(),
    };
    Ok(json!({
        "tasks": changed,
        "sync_token": encode_token(Utc::now()),
    }))
}

fn parse_task(options: &Value) -> Result<Task, (i64, String)> {
    serde_json::from_value(options["task"].clone())
        .map_err(|e| (INVALID_PARAMS, format!("malformed task: {}", e)))
}

fn todo_write(state: &AppState, options: &Value) -> Result<Value, (i64, String)> {
    let task = parse_task(options)?;
    state
        .store
        .upsert_task(&task)
        .map_err(|e| (domain_code(&e), e.to_string()))?;
    state.bus.publish(
        TOPIC_TASKS,
        Event::new(
            EventType::TaskCreated,
            Some(task.repository.clone()),
            serde_json::to_value(&task).unwrap_or_default(),
        ),
    );
    Ok(json!({"ok": true, "task_id": task.id}))
}

fn todo_update(state: &AppState, options: &Value) -> Result<Value, (i64, String)> {
    if options["deleted"].as_bool() == Some(true) {
        let task_id = required_str(options, "task_id")?;
        let repository = state.store.get_task(task_id).ok().map(|t| t.repository);
        state
            .store
            .remove_task(task_id)
            .map_err(|e| (domain_code(&e), e.to_string()))?;
        state.bus.publish(
            TOPIC_TASKS,
            Event::new(EventType::TaskDeleted, repository, json!({"task_id": task_id})),
        );
        return Ok(json!({"ok": true}));
    }

    let task = parse_task(options)?;
    state
        .store
        .upsert_task(&task)
        .map_err(|e| (domain_code(&e), e.to_string()))?;
    state.bus.publish(
        TOPIC_TASKS,
        Event::new(
            EventType::TaskUpdated,
            Some(task.repository.clone()),
            serde_json::to_value(&task).unwrap_or_default(),
        ),
    );
    Ok(json!({"ok": true, "task_id": task.id}))
}

// ── Push registration ──────────────────────────────────────────────────────

pub async fn register_push(
    State(state): State<AppState>,
    Json(registration): Json<PushRegistration>,
) -> impl IntoResponse {
    match state.push.register(registration) {
        Ok(()) => (StatusCode::CREATED, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "kind": e.kind(), "message": e.to_string()})),
        ),
    }
}

pub async fn deregister_push(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    if state.push.deregister(&client_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use memoro_core::config::Config;

    fn state() -> AppState {
        AppState::build_in_memory(&Config::default()).unwrap()
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let state = state();
        let err = dispatch(&state, "memory_explode", &json!({})).unwrap_err();
        assert_eq!(err.0, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_operation_is_32602() {
        let state = state();
        let err = dispatch(&state, "memory_tasks", &json!({"operation": "todo_erase"}))
            .unwrap_err();
        assert_eq!(err.0, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn chunk_lifecycle_through_dispatch() {
        let state = state();
        let created = dispatch(
            &state,
            "memory_create",
            &json!({
                "operation": "store_chunk",
                "options": {"repository": "repoA", "content": "remember the auth fix"},
            }),
        )
        .unwrap();
        let chunk_id = created["chunk_id"].as_str().unwrap().to_string();

        let found = dispatch(
            &state,
            "memory_read",
            &json!({
                "operation": "search",
                "options": {"repository": "repoA", "query": "auth", "limit": 5},
            }),
        )
        .unwrap();
        assert_eq!(found["chunks"].as_array().unwrap().len(), 1);

        dispatch(
            &state,
            "memory_update",
            &json!({
                "operation": "update_thread",
                "options": {"thread_id": chunk_id, "metadata": {"thread": "t9"}},
            }),
        )
        .unwrap();

        let chunk = dispatch(
            &state,
            "memory_read",
            &json!({"operation": "get_chunk", "options": {"chunk_id": chunk_id}}),
        )
        .unwrap();
        assert_eq!(chunk["metadata"]["thread"], json!("t9"));
    }

    #[tokio::test]
    async fn missing_chunk_surfaces_domain_code() {
        let state = state();
        let err = dispatch(
            &state,
            "memory_read",
            &json!({"operation": "get_chunk", "options": {"chunk_id": "ghost"}}),
        )
        .unwrap_err();
        assert_eq!(err.0, 1002);
    }

    #[tokio::test]
    async fn todo_write_then_read_with_cursor() {
        let state = state();
        let task = Task::new("repoA", "pushed from client").unwrap();
        dispatch(
            &state,
            "memory_tasks",
            &json!({"operation": "todo_write", "options": {"task": &task}}),
        )
        .unwrap();

        let read = dispatch(
            &state,
            "memory_tasks",
            &json!({"operation": "todo_read", "options": {"repository": "repoA"}}),
        )
        .unwrap();
        assert_eq!(read["tasks"].as_array().unwrap().len(), 1);
        let token = read["sync_token"].as_str().unwrap().to_string();

        // Nothing changed since the cursor: empty delta, fresh token
        let delta = dispatch(
            &state,
            "memory_tasks",
            &json!({
                "operation": "todo_read",
                "options": {"repository": "repoA", "since_token": token},
            }),
        )
        .unwrap();
        assert!(delta["tasks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn todo_update_delete_removes_row() {
        let state = state();
        let task = Task::new("repoA", "short lived").unwrap();
        dispatch(
            &state,
            "memory_tasks",
            &json!({"operation": "todo_write", "options": {"task": &task}}),
        )
        .unwrap();
        dispatch(
            &state,
            "memory_tasks",
            &json!({"operation": "todo_update", "options": {"task_id": task.id, "deleted": true}}),
        )
        .unwrap();
        let read = dispatch(
            &state,
            "memory_tasks",
            &json!({"operation": "todo_read", "options": {"repository": "repoA"}}),
        )
        .unwrap();
        assert!(read["tasks"].as_array().unwrap().is_empty());
    }
}
