use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kiln::config::Config;
use kiln::core::{Phase, Task, WorkspaceMode};
use kiln::orchestration::{PhaseRequest, PhaseRunner, ProcessLauncher, Scheduler, WorkerLauncher};
use kiln::state::TaskStore;
use kiln::{log, Error, Result};

const ONCE_GRACE: Duration = Duration::from_secs(30);

/// Kiln - runs queued coding tasks through isolated Claude workers
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KILN_DEBUG=1        Enable debug logging (alternative to --debug)\n    KILN_LOG=<filter>   tracing filter directive\n    KILN_TOOL_PATH      Path to the claude executable")]
pub struct Cli {
    /// Enable debug logging and the workspace isolation check
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Directory holding kiln.toml, the store and workspaces
    #[arg(long, global = true, default_value = ".kiln")]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the scheduler loop
    Schedule {
        /// Run one dispatch pass, wait for the workers it started, then exit
        #[arg(long)]
        once: bool,
    },

    /// Run one phase of one task (started by the scheduler)
    Worker {
        /// Role the worker acts as
        role: String,

        /// Run a single phase and exit
        #[arg(long)]
        once: bool,

        #[arg(long)]
        task_id: String,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        workspace: PathBuf,

        #[arg(long, default_value = "apply")]
        phase: Phase,

        #[arg(long, default_value = "repo")]
        mode: WorkspaceMode,
    },

    /// Add a task to the queue
    Submit {
        /// Task id, also used for file and branch names
        id: String,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Tag; the first tag naming a role picks the role
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Task that must complete first
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Task whose latest result is summarized into the instruction
        #[arg(long = "context-from")]
        context_from: Vec<String>,

        /// Acceptance criterion
        #[arg(long = "criteria")]
        criteria: Vec<String>,
    },

    /// Print every task's state
    Status,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "kiln failed");
            eprintln!("kiln: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(&cli.state_dir)?;
    match cli.command {
        Command::Schedule { once } => {
            log::init_file(&config.log_path(), cli.debug)?;
            run_scheduler(config, once, cli.debug)?;
            Ok(0)
        }
        Command::Worker {
            role,
            once,
            task_id,
            run_id,
            workspace,
            phase,
            mode,
        } => {
            log::init_stderr(cli.debug);
            if !once {
                return Err(Error::Validation("workers only run with --once".into()));
            }
            let request = PhaseRequest {
                task_id,
                role,
                phase,
                workspace,
                run_id,
                mode,
            };
            run_worker(&config, &request)
        }
        Command::Submit {
            id,
            title,
            description,
            tags,
            depends_on,
            context_from,
            criteria,
        } => {
            log::init_stderr(cli.debug);
            let store = TaskStore::open(&config.store_dir())?;
            let mut task = Task::new(&id, &title).with_description(&description);
            task.tags = tags;
            task.depends_on = depends_on;
            task.context_from = context_from;
            task.acceptance_criteria = criteria;
            store.create(&mut task)?;
            println!("queued {} as {}", task.id, config.role_for_tags(&task.tags));
            Ok(0)
        }
        Command::Status => {
            let store = TaskStore::open(&config.store_dir())?;
            print_status(&store)?;
            Ok(0)
        }
    }
}

fn run_scheduler(config: Config, once: bool, debug: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = TaskStore::open(&config.store_dir())?;
        let launcher = match &config.worker_command {
            Some(program) => ProcessLauncher::new(PathBuf::from(program), &config.state_dir, store.clone()),
            None => ProcessLauncher::current_exe(&config.state_dir, store.clone())?,
        };
        let launcher: Arc<dyn WorkerLauncher> = Arc::new(launcher.with_debug(debug || log::is_debug()));
        // Apply and test each get the full phase timeout, plus worker startup.
        let once_limit = config.phase_timeout() * 2 + ONCE_GRACE;
        let mut scheduler = Scheduler::new(config, store, launcher);

        if once {
            let summary = scheduler.run_once(once_limit).await?;
            info!(?summary, "single run done");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                signal.cancel();
            }
        });
        scheduler.run(shutdown).await
    })
}

fn run_worker(config: &Config, request: &PhaseRequest) -> Result<i32> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runner = PhaseRunner::from_config(config)?;
        let record = runner.run(request).await?;
        Ok(record.status.exit_code())
    })
}

fn print_status(store: &TaskStore) -> Result<()> {
    let tasks = store.list_all()?;
    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!(
        "{:<24} {:<12} {:<6} {:<8} {:<10} REASON",
        "ID", "STATUS", "PHASE", "RETRIES", "ASSIGNEE"
    );
    for task in tasks {
        println!(
            "{:<24} {:<12} {:<6} {:<8} {:<10} {}",
            task.id,
            task.status.to_string(),
            task.current_phase.as_str(),
            task.retry_count,
            task.assignee.as_deref().unwrap_or("-"),
            task.failure_reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
