use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use nudge_core::{
    AnalyticsSink, AppState, NoopAnalytics, PromptSurface, StoreRedirector, SurfaceError,
    TriggerContext, TriggerKind, UserAction,
};
use nudge_engine::{load_config_from_path, Collaborators, ReviewManager};
use nudge_store::{Database, SqliteKvStore};
use nudge_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "nudge", about = "Decide when to ask for an app review")]
struct Cli {
    /// SQLite database path, or `:memory:`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a user action.
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Evaluate a trigger and show the prompt if warranted.
    Check {
        trigger: TriggerKind,
        #[arg(long, default_value = "home")]
        screen: String,
        #[arg(long)]
        loading: bool,
        #[arg(long)]
        errors: bool,
        /// Answer the prompt without asking.
        #[arg(long, value_enum)]
        answer: Option<Answer>,
    },
    /// Print metrics, settings, and component statistics.
    Status,
    /// Clear all persisted review state.
    Reset,
}

#[derive(Subcommand)]
enum RecordAction {
    AppOpen,
    FoodLog,
    Milestone { name: String },
    Streak { days: u32 },
    Session { minutes: u64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Answer {
    Yes,
    No,
}

impl From<RecordAction> for UserAction {
    fn from(action: RecordAction) -> Self {
        match action {
            RecordAction::AppOpen => UserAction::app_open_now(),
            RecordAction::FoodLog => UserAction::SuccessfulFoodLog,
            RecordAction::Milestone { name } => UserAction::MilestoneAchieved { milestone: name },
            RecordAction::Streak { days } => UserAction::StreakUpdated { days },
            RecordAction::Session { minutes } => UserAction::SessionTime { minutes },
        }
    }
}

/// Prompt surface backed by the terminal.
struct ConsolePrompt {
    answer: Option<Answer>,
}

#[async_trait]
impl PromptSurface for ConsolePrompt {
    async fn is_available(&self) -> Result<bool, SurfaceError> {
        Ok(true)
    }

    async fn request_review(&self) -> Result<bool, SurfaceError> {
        if let Some(answer) = self.answer {
            return Ok(matches!(answer, Answer::Yes));
        }
        tokio::task::spawn_blocking(|| {
            print!("Enjoying the app? Leave a review [y/N]: ");
            std::io::stdout()
                .flush()
                .map_err(|e| SurfaceError::new(e.to_string()))?;
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| SurfaceError::new(e.to_string()))?;
            Ok(matches!(line.trim(), "y" | "Y" | "yes"))
        })
        .await
        .map_err(|e| SurfaceError::new(format!("prompt task failed: {e}")))?
    }
}

/// Redirector that prints the store URL instead of opening it.
struct PrintRedirector;

#[async_trait]
impl StoreRedirector for PrintRedirector {
    async fn open_external_url(&self, url: &str) -> Result<(), SurfaceError> {
        info!(url, "store page redirect");
        println!("Open {url} to leave a review.");
        Ok(())
    }
}

fn nudge_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".nudge")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: if cli.verbose { Level::DEBUG } else { Level::WARN },
        json: cli.json_logs,
        ..Default::default()
    });

    let config_path = cli.config.unwrap_or_else(|| nudge_home().join("config.json"));
    let mut config = load_config_from_path(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    // One-shot process: writes are flushed explicitly on shutdown.
    config.manager.background_tasks = false;

    let db = match cli.db {
        Some(path) if path.as_os_str() == ":memory:" => Database::in_memory()?,
        Some(path) => Database::open(&path)?,
        None => Database::open(&nudge_home().join("nudge.db"))?,
    };

    let answer = match &cli.command {
        Command::Check { answer, .. } => *answer,
        _ => None,
    };
    let analytics: Arc<dyn AnalyticsSink> = match telemetry.metrics() {
        Some(recorder) => recorder as Arc<dyn AnalyticsSink>,
        None => Arc::new(NoopAnalytics),
    };
    let manager = ReviewManager::new(
        config,
        Collaborators {
            store: Arc::new(SqliteKvStore::new(db)),
            surface: Arc::new(ConsolePrompt { answer }),
            redirector: Arc::new(PrintRedirector),
            analytics,
        },
    );
    manager.initialize().await;

    match cli.command {
        Command::Record { action } => {
            let action = UserAction::from(action);
            let kind = action.action_type();
            manager.record_user_action(action).await;
            manager.flush().await;
            println!("recorded {kind}");
        }
        Command::Check {
            trigger,
            screen,
            loading,
            errors,
            ..
        } => {
            let mut app_state = AppState::idle(screen);
            app_state.is_loading = loading;
            app_state.has_errors = errors;
            let shown = manager
                .check_and_trigger_review(&TriggerContext::new(trigger, app_state))
                .await;
            println!("{}", if shown { "review completed" } else { "no review" });
        }
        Command::Status => {
            let status = serde_json::json!({
                "metrics": manager.get_user_metrics().await,
                "settings": manager.get_review_settings().await,
                "next_eligible_time": manager.get_next_eligible_time().await,
                "stats": manager.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Reset => {
            manager.reset_review_state().await;
            println!("review state cleared");
        }
    }

    manager.shutdown().await;
    Ok(())
}
