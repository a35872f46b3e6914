//! covenctl - CLI client for the covend daemon.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use mimalloc::MiMalloc;
use serde_json::Value;
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Control plane client for the covend workflow daemon.
#[derive(Parser)]
#[command(name = "covenctl")]
#[command(about = "Control plane for the covend workflow daemon")]
#[command(version)]
struct Cli {
    /// Workspace root containing .coven/covend.sock.
    #[arg(long, global = true, env = "COVEN_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Daemon health and uptime.
    Status,
    /// List all known tasks.
    Tasks,
    /// Create a task.
    Add {
        /// Task id (externally assigned, stable).
        id: String,
        /// Short title.
        title: String,
        /// Longer description.
        #[arg(long, default_value = "")]
        description: String,
        /// Priority (lower is higher).
        #[arg(long, default_value_t = 2)]
        priority: i64,
        /// Task type: task, bug, feature, test, refactor.
        #[arg(long = "type", default_value = "task", value_parser = parse_task_type)]
        task_type: coven_core::TaskType,
        /// Labels, repeatable.
        #[arg(long)]
        label: Vec<String>,
    },
    /// Claim a task and start its workflow.
    Start {
        id: String,
        /// Explicit grimoire name (default: resolved from labels/type).
        #[arg(long)]
        grimoire: Option<String>,
    },
    /// Cancel a task's running workflow.
    Stop { id: String },
    /// List agents.
    Agents,
    /// Tail an agent's captured output.
    Output {
        /// Task id or step task id (workflow:step).
        id: String,
        /// Return lines with sequence greater than this.
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Kill an agent's process group.
    Kill { id: String },
    /// Write a line to an agent's stdin.
    Respond { id: String, response: String },
    /// List questions.
    Questions {
        #[arg(long)]
        task_id: Option<String>,
        /// Only unanswered questions.
        #[arg(long)]
        pending: bool,
    },
    /// Answer a question (and deliver it to the agent).
    Answer { id: String, answer: String },
    /// Show the workflow for a task.
    Workflow { task_id: String },
    /// Approve a pending merge.
    Approve {
        workflow_id: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Reject a pending merge.
    Reject {
        workflow_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel a workflow.
    Cancel { workflow_id: String },
    /// Retry a failed or blocked workflow from its failing step.
    Retry { workflow_id: String },
    /// Stream daemon events (SSE).
    Events {
        /// Resume after this event sequence number.
        #[arg(long)]
        since: Option<i64>,
    },
    /// Stop the daemon gracefully.
    Shutdown,
}

fn parse_task_type(s: &str) -> Result<coven_core::TaskType, String> {
    coven_core::TaskType::parse(s)
        .ok_or_else(|| format!("unknown task type {s:?} (task|bug|feature|test|refactor)"))
}

fn rows(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

async fn run(cli: Cli) -> Result<(), ClientError> {
    let client = Client::new(&cli.workspace);

    match cli.command {
        Command::Status => {
            let health = client.health().await?;
            println!("{}", render::pretty(&health));
        }
        Command::Tasks => {
            let response = client.tasks().await?;
            print!(
                "{}",
                render::table(
                    &rows(&response, "tasks"),
                    &[
                        ("id", "id"),
                        ("title", "title"),
                        ("type", "type"),
                        ("priority", "prio"),
                        ("status", "status"),
                        ("labels", "labels"),
                    ],
                )
            );
        }
        Command::Add {
            id,
            title,
            description,
            priority,
            task_type,
            label,
        } => {
            let response = client
                .create_task(serde_json::json!({
                    "id": id,
                    "title": title,
                    "description": description,
                    "priority": priority,
                    "type": task_type.as_str(),
                    "labels": label,
                }))
                .await?;
            println!("created {}", response["task"]["id"].as_str().unwrap_or("?"));
        }
        Command::Start { id, grimoire } => {
            let response = client.start_task(&id, grimoire.as_deref()).await?;
            println!(
                "workflow {} started ({})",
                response["workflow"]["id"].as_str().unwrap_or("?"),
                response["workflow"]["grimoire"].as_str().unwrap_or("?"),
            );
        }
        Command::Stop { id } => {
            client.stop_task(&id).await?;
            println!("cancelling workflow for {id}");
        }
        Command::Agents => {
            let response = client.agents().await?;
            print!(
                "{}",
                render::table(
                    &rows(&response, "agents"),
                    &[
                        ("step_task_id", "agent"),
                        ("task_id", "task"),
                        ("pid", "pid"),
                        ("status", "status"),
                    ],
                )
            );
        }
        Command::Output { id, since } => {
            let response = client.agent_output(&id, since).await?;
            if let Some(from) = response["truncated_from_seq"].as_u64() {
                eprintln!("(truncated: oldest available seq is {from})");
            }
            for line in rows(&response, "lines") {
                println!(
                    "{:>6} {} {}",
                    line["seq"].as_u64().unwrap_or(0),
                    line["stream"].as_str().unwrap_or("?"),
                    line["text"].as_str().unwrap_or(""),
                );
            }
        }
        Command::Kill { id } => {
            client.kill_agent(&id).await?;
            println!("killed {id}");
        }
        Command::Respond { id, response } => {
            client.respond(&id, &response).await?;
            println!("delivered");
        }
        Command::Questions { task_id, pending } => {
            let response = client.questions(task_id.as_deref(), pending).await?;
            print!(
                "{}",
                render::table(
                    &rows(&response, "questions"),
                    &[
                        ("id", "id"),
                        ("task_id", "task"),
                        ("text", "question"),
                        ("answer", "answer"),
                        ("delivery", "delivery"),
                    ],
                )
            );
        }
        Command::Answer { id, answer } => {
            let response = client.answer(&id, &answer).await?;
            if response["delivered"].as_bool().unwrap_or(false) {
                println!("answered and delivered");
            } else {
                println!("answered (delivery failed; agent may have exited)");
            }
        }
        Command::Workflow { task_id } => {
            let response = client.workflow(&task_id).await?;
            println!("{}", render::pretty(&response["workflow"]));
        }
        Command::Approve {
            workflow_id,
            feedback,
        } => {
            let response = client
                .approve_merge(&workflow_id, feedback.as_deref())
                .await?;
            println!("{}", response["status"].as_str().unwrap_or("merged"));
        }
        Command::Reject {
            workflow_id,
            reason,
        } => {
            client.reject_merge(&workflow_id, reason.as_deref()).await?;
            println!("rejected");
        }
        Command::Cancel { workflow_id } => {
            client.cancel_workflow(&workflow_id).await?;
            println!("cancelling");
        }
        Command::Retry { workflow_id } => {
            let response = client.retry_workflow(&workflow_id).await?;
            println!(
                "retrying from step {}",
                response["workflow"]["current_step"].as_u64().unwrap_or(0)
            );
        }
        Command::Events { since } => {
            client
                .tail_events(since, |chunk| {
                    print!("{chunk}");
                })
                .await?;
        }
        Command::Shutdown => {
            client.shutdown().await?;
            println!("shutting down");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("covenctl: {e}");
        if let ClientError::Api {
            details: Some(details),
            ..
        } = &e
        {
            eprintln!("{}", render::pretty(details));
        }
        std::process::exit(1);
    }
}
