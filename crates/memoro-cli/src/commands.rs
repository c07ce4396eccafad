// Command implementations. Human output is terse, one line per fact;
// `--json` switches every command to machine-readable output.

use crate::app::App;
use clap::Subcommand;
use memoro_core::ai::complexity;
use memoro_core::error::{Error, Result};
use memoro_core::push::PushRegistration;
use memoro_core::store::TaskFilter;
use memoro_core::sync::{NewTask, TaskPatch};
use memoro_core::types::{AiOperation, AiRequest, Task, TaskPriority, TaskStatus};
use memoro_core::Ctx;
use std::time::Duration;

/// Default deadline for one CLI operation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Add a task.
    Add {
        content: String,
        #[arg(long, value_parser = parse_priority)]
        priority: Option<TaskPriority>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Estimated minutes (0 = unknown).
        #[arg(long, default_value_t = 0)]
        estimate: u32,
        #[arg(long)]
        parent: Option<String>,
    },
    /// List tasks in the repository.
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
        #[arg(long, value_parser = parse_priority)]
        priority: Option<TaskPriority>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show one task with its activity trail.
    Show { id: String },
    /// Update task fields.
    Update {
        id: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long, value_parser = parse_priority)]
        priority: Option<TaskPriority>,
        #[arg(long)]
        actual: Option<u32>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Move a task to in_progress.
    Start { id: String },
    /// Complete a task.
    Done { id: String },
    /// Cancel a task.
    Cancel { id: String },
    /// Reopen a completed or cancelled task.
    Reopen { id: String },
    /// Delete a task.
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum SessionCommand {
    /// Start an interactive document session.
    Start {
        /// Document type, e.g. "prd" or "trd".
        doc_type: String,
    },
    /// Send the next message in a session.
    Continue { id: String, message: String },
    /// End a session.
    End { id: String },
}

fn parse_priority(raw: &str) -> std::result::Result<TaskPriority, String> {
    TaskPriority::parse(raw).map_err(|e| e.to_string())
}

fn parse_status(raw: &str) -> std::result::Result<TaskStatus, String> {
    TaskStatus::parse(raw).map_err(|e| e.to_string())
}

fn print_task(task: &Task, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(task).unwrap_or_default());
        return;
    }
    println!(
        "{}  [{}] [{}] {}",
        task.id,
        task.status.as_str(),
        task.priority.as_str(),
        task.content
    );
    if !task.tags.is_empty() {
        println!("  tags: {}", task.tags.join(", "));
    }
}

// ── task ───────────────────────────────────────────────────────────────────

pub async fn run_task(app: &App, command: TaskCommand, json: bool) -> Result<()> {
    let ctx = Ctx::with_timeout(COMMAND_TIMEOUT);
    match command {
        TaskCommand::Add { content, priority, tags, estimate, parent } => {
            let task = app
                .engine
                .create_task(
                    NewTask {
                        repository: app.repository.clone(),
                        content,
                        priority,
                        tags,
                        estimated_minutes: estimate,
                        parent_task_id: parent,
                        session_id: None,
                    },
                    &ctx,
                )
                .await?;
            print_task(&task, json);
            if !app.online.is_online() && !json {
                println!("  (offline — queued for sync)");
            }
            Ok(())
        }
        TaskCommand::List { status, priority, tag } => {
            let tasks = app.store.list_tasks(&TaskFilter {
                repository: Some(app.repository.clone()),
                status,
                priority,
                tag,
                ..Default::default()
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks).unwrap_or_default());
            } else if tasks.is_empty() {
                println!("no tasks in '{}'", app.repository);
            } else {
                for task in &tasks {
                    print_task(task, false);
                }
            }
            Ok(())
        }
        TaskCommand::Show { id } => {
            let task = app.store.get_task(&id)?;
            print_task(&task, json);
            if !json {
                for (kind, content) in app.store.list_activity(&id, 10)? {
                    println!("  {} — {}", kind, content);
                }
            }
            Ok(())
        }
        TaskCommand::Update { id, content, priority, actual, tags } => {
            let task = app
                .engine
                .update_task(
                    &id,
                    TaskPatch {
                        content,
                        priority,
                        actual_minutes: actual,
                        add_tags: tags,
                        ..Default::default()
                    },
                    &ctx,
                )
                .await?;
            print_task(&task, json);
            Ok(())
        }
        TaskCommand::Start { id } => transition(app, &id, TaskStatus::InProgress, json, &ctx).await,
        TaskCommand::Done { id } => transition(app, &id, TaskStatus::Completed, json, &ctx).await,
        TaskCommand::Cancel { id } => transition(app, &id, TaskStatus::Cancelled, json, &ctx).await,
        TaskCommand::Reopen { id } => transition(app, &id, TaskStatus::Pending, json, &ctx).await,
        TaskCommand::Delete { id } => {
            app.engine.delete_task(&id, &ctx).await?;
            if !json {
                println!("deleted {}", id);
            }
            Ok(())
        }
    }
}

async fn transition(app: &App, id: &str, to: TaskStatus, json: bool, ctx: &Ctx) -> Result<()> {
    let task = app.engine.transition_task(id, to, ctx).await?;
    print_task(&task, json);
    Ok(())
}

// ── sync ───────────────────────────────────────────────────────────────────

pub async fn run_sync(app: &App, json: bool) -> Result<()> {
    let ctx = Ctx::with_timeout(COMMAND_TIMEOUT);
    let report = app.engine.sync(&app.repository, &ctx).await?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "repository": report.repository,
                "pushed": report.pushed,
                "created": report.created,
                "updated": report.updated,
                "unchanged": report.unchanged,
                "conflicts_detected": report.conflicts_detected,
                "conflicts_resolved": report.conflicts_resolved,
                "unresolved": report.unresolved.len(),
            })
        );
    } else {
        println!(
            "synced '{}': {} pushed, {} pulled, {} updated, {} conflicts resolved",
            report.repository, report.pushed, report.created, report.updated,
            report.conflicts_resolved
        );
    }
    if !report.unresolved.is_empty() {
        let ids: Vec<&str> = report.unresolved.iter().map(|c| c.task_id.as_str()).collect();
        return Err(Error::Conflict {
            task_id: ids.join(", "),
            message: format!("{} conflict(s) need manual resolution", report.unresolved.len()),
        });
    }
    Ok(())
}

// ── AI commands ────────────────────────────────────────────────────────────

/// Inputs starting with '@' are read from the named file.
fn resolve_input(input: String) -> Result<String> {
    match input.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => Ok(input),
    }
}

pub async fn run_generate(
    app: &App,
    operation: AiOperation,
    input: String,
    json: bool,
) -> Result<()> {
    let ctx = Ctx::with_timeout(COMMAND_TIMEOUT);
    let mut request = AiRequest::new(operation, resolve_input(input)?);
    request.repository = Some(app.repository.clone());
    let response = app.router.route(&request, &ctx).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
    } else {
        println!("{}", response.content);
        eprintln!(
            "— {} ({} in / {} out tokens, {}ms{})",
            response.model_used,
            response.tokens_in,
            response.tokens_out,
            response.latency_ms,
            if response.cache_hit { ", cached" } else { "" }
        );
    }
    Ok(())
}

pub async fn run_complexity(app: &App, input: String, json: bool) -> Result<()> {
    let ctx = Ctx::with_timeout(COMMAND_TIMEOUT);
    let content = resolve_input(input)?;
    let mut request = AiRequest::new(AiOperation::Complexity, content.clone());
    request.repository = Some(app.repository.clone());
    let response = app.router.route(&request, &ctx).await?;
    let estimate = complexity::parse_or_estimate(&response.content, &content);
    if json {
        println!("{}", serde_json::to_string_pretty(&estimate).unwrap_or_default());
    } else {
        println!(
            "complexity: {:?} (score {:.1}/10, ~{:.1}h, confidence {:.2})",
            estimate.overall, estimate.numeric_score, estimate.estimated_hours, estimate.confidence
        );
        for factor in &estimate.factors {
            println!("  - {}", factor);
        }
    }
    Ok(())
}

pub async fn run_session(app: &App, command: SessionCommand, json: bool) -> Result<()> {
    let ctx = Ctx::with_timeout(COMMAND_TIMEOUT);
    match command {
        SessionCommand::Start { doc_type } => {
            let id = app.router.start_session(&doc_type, Some(app.repository.clone()));
            if json {
                println!("{}", serde_json::json!({"session_id": id}));
            } else {
                println!("session {} started ({})", id, doc_type);
            }
            Ok(())
        }
        SessionCommand::Continue { id, message } => {
            let response = app.router.continue_session(&id, &message, &ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            } else {
                println!("{}", response.content);
            }
            Ok(())
        }
        SessionCommand::End { id } => {
            let summary = app.router.end_session(&id)?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({"session_id": summary.id, "steps": summary.steps})
                );
            } else {
                println!("session {} ended after {} steps", summary.id, summary.steps);
            }
            Ok(())
        }
    }
}

// ── push registration ──────────────────────────────────────────────────────

pub async fn run_register_push(app: &App, url: String, client_id: String) -> Result<()> {
    let registration = PushRegistration {
        url,
        client_id: client_id.clone(),
        version: env!("CARGO_PKG_VERSION").into(),
        capabilities: 0,
        repositories: vec![app.repository.clone()],
    };
    let target = format!("{}/cli/register", app.config.server_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&target)
        .json(&registration)
        .timeout(Duration::from_secs(5))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Protocol {
            code: response.status().as_u16() as i64,
            message: "push registration rejected".into(),
        });
    }
    println!("registered {} for push delivery", client_id);
    Ok(())
}

// ── watch (long-running client daemon) ─────────────────────────────────────

/// Run the background client: health probing against the server, the
/// periodic full-sync tick, provider probing, and event-log maintenance.
/// Blocks until Ctrl-C.
pub async fn run_watch(app: &App) -> Result<()> {
    use memoro_core::rpc::{spawn_health_prober, RpcTransport};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    println!("watching '{}' — press Ctrl-C to stop", app.repository);
    let stop = Arc::new(AtomicBool::new(false));

    let endpoint = format!("{}/mcp", app.config.server_url.trim_end_matches('/'));
    let probe_transport = Arc::new(RpcTransport::new(
        endpoint,
        app.config.retry.clone(),
        app.config.breaker.clone(),
    ));
    spawn_health_prober(
        probe_transport,
        Arc::clone(&app.bus),
        Arc::clone(&app.online),
        app.config.health.clone(),
        Arc::clone(&stop),
    );
    memoro_core::sync::spawn_sync_ticker(Arc::clone(&app.engine), Arc::clone(&stop));
    memoro_core::ai::spawn_provider_prober(
        Arc::clone(&app.router),
        Some(Arc::clone(&app.store)),
        Arc::clone(&stop),
    );
    memoro_core::bus::spawn_maintenance(Arc::clone(&app.bus), Arc::clone(&stop));

    let _ = tokio::signal::ctrl_c().await;
    stop.store(true, Ordering::Relaxed);
    println!("stopped");
    Ok(())
}

// ── status ─────────────────────────────────────────────────────────────────

pub async fn run_status(app: &App, json: bool) -> Result<()> {
    let pending = app.store.pending_op_count(&app.repository)?;
    let token = app.store.sync_token(&app.repository)?;
    let usage = app.router.usage_report();
    let online = app.online.is_online();
    let pool = app.remote.pool_metrics();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "repository": app.repository,
                "online": online,
                "pending_operations": pending,
                "sync_token": token,
                "providers": usage,
                "pool": {
                    "in_use": pool.in_use,
                    "idle": pool.idle,
                    "wait_queue_depth": pool.wait_queue_depth,
                },
            })
        );
        return Ok(());
    }

    println!("repository: {}", app.repository);
    println!("server: {} ({})", app.config.server_url, if online { "online" } else { "offline" });
    println!("pending sync operations: {}", pending);
    if let Some(token) = token {
        println!("sync cursor: {}", token);
    }
    if usage.is_empty() {
        println!("ai usage: none this session");
    } else {
        for provider in usage {
            println!(
                "ai usage [{}]: {} requests, {} in / {} out tokens, ${:.4} today",
                provider.provider,
                provider.requests,
                provider.tokens_in,
                provider.tokens_out,
                provider.day_usd
            );
        }
    }
    Ok(())
}
