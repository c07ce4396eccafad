// Memoro CLI — tasks, sync, and AI generation against a Memory Protocol
// Server. Every failure prints one human sentence plus the stable machine
// kind on stderr, and the process exit code follows the error contract:
// 0 success, 1 usage, 2 network/remote, 3 conflict, 4 budget/rate.

mod app;
mod commands;

use clap::{Parser, Subcommand};
use commands::TaskCommand;

#[derive(Parser)]
#[command(name = "memoro", version, about = "Memoro developer memory CLI")]
struct Cli {
    /// Repository scope; defaults to the current directory name.
    #[arg(long, short, global = true)]
    repository: Option<String>,

    /// Path to the config file.
    #[arg(long, global = true, env = "MEMORO_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Synchronize the repository with the server.
    Sync,
    /// Generate a product requirements document.
    GeneratePrd { input: String },
    /// Generate a technical requirements document.
    GenerateTrd { input: String },
    /// Generate main tasks from a document.
    GenerateTasks { input: String },
    /// Break a task into sub-tasks.
    GenerateSubtasks { input: String },
    /// Analyze repository content.
    Analyze { input: String },
    /// Estimate task complexity.
    Complexity { input: String },
    /// Interactive document session.
    #[command(subcommand)]
    Session(commands::SessionCommand),
    /// Register this client for HTTP push delivery.
    RegisterPush {
        /// Endpoint URL the server should POST events to.
        #[arg(long)]
        url: String,
        /// Stable client identifier.
        #[arg(long)]
        client_id: String,
    },
    /// Show connection, queue, and AI usage status.
    Status,
    /// Run the background client: health probing, periodic sync, provider
    /// probing. Blocks until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let exit = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {} [{}]", e, e.kind());
            e.exit_code()
        }
    };
    std::process::exit(exit);
}

async fn run(cli: Cli) -> memoro_core::Result<()> {
    let app = app::App::build(cli.config.as_deref(), cli.repository.clone()).await?;
    let json = cli.json;

    match cli.command {
        Command::Task(command) => commands::run_task(&app, command, json).await,
        Command::Sync => commands::run_sync(&app, json).await,
        Command::GeneratePrd { input } => {
            commands::run_generate(&app, memoro_core::types::AiOperation::PrdGenerate, input, json)
                .await
        }
        Command::GenerateTrd { input } => {
            commands::run_generate(&app, memoro_core::types::AiOperation::TrdGenerate, input, json)
                .await
        }
        Command::GenerateTasks { input } => {
            commands::run_generate(&app, memoro_core::types::AiOperation::MainTasks, input, json)
                .await
        }
        Command::GenerateSubtasks { input } => {
            commands::run_generate(&app, memoro_core::types::AiOperation::SubTasks, input, json)
                .await
        }
        Command::Analyze { input } => {
            commands::run_generate(&app, memoro_core::types::AiOperation::Analyze, input, json)
                .await
        }
        Command::Complexity { input } => commands::run_complexity(&app, input, json).await,
        Command::Session(command) => commands::run_session(&app, command, json).await,
        Command::RegisterPush { url, client_id } => {
            commands::run_register_push(&app, url, client_id).await
        }
        Command::Status => commands::run_status(&app, json).await,
        Command::Watch => commands::run_watch(&app).await,
    }
}
