use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use jobsite::approval::{ApprovalStore, InboxWatcher};
use jobsite::cli::{Cli, Command};
use jobsite::job::JobSubmission;
use jobsite::ui::{self, JobProgress};
use jobsite::{JobEngine, JobsiteConfig, StandardResolver};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = JobsiteConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let verbose = cli.verbose;

    match cli.command {
        Command::Run(args) => {
            let mut engine_config = config.engine_config();
            if args.keep {
                engine_config.cleanup = false;
            }
            let engine = JobEngine::new(engine_config, StandardResolver::new()?);
            shutdown_on_ctrl_c(&engine);

            let name = args.name.clone();
            let handle = engine.submit(args.into_submission())?;
            let progress = JobProgress::start(&name);
            let result = handle.wait().await?;
            progress.complete(&result);
            ui::print_result(&result, verbose);
            Ok(exit_code(result.is_success()))
        }
        Command::Batch { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let submissions: Vec<JobSubmission> = serde_json::from_str(&contents)
                .with_context(|| format!("invalid batch file {}", file.display()))?;

            let engine = JobEngine::new(config.engine_config(), StandardResolver::new()?);
            shutdown_on_ctrl_c(&engine);
            let results: Vec<_> = engine
                .submit_batch(submissions)
                .await
                .into_iter()
                .map(|r| r.map_err(|e| e.to_string()))
                .collect();
            ui::print_batch(&results);
            let ok = results.iter().all(|r| matches!(r, Ok(result) if result.is_success()));
            Ok(exit_code(ok))
        }
        Command::Submit {
            to,
            name,
            script_file,
        } => {
            let script = std::fs::read_to_string(&script_file)
                .with_context(|| format!("failed to read {}", script_file.display()))?;
            let path = config.approval_store().submit(&to, &name, &script)?;
            println!("Submitted {name} to {to}: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let store = config.approval_store();
            let entries = store.list(store.identity())?;
            ui::print_entries(store.identity(), &entries);
            Ok(ExitCode::SUCCESS)
        }
        Command::Approve { name } => {
            let store = config.approval_store();
            let mut entry = store.find(store.identity(), &name)?;
            let path = store.approve(&mut entry)?;
            println!("Approved {name}: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Accept { name, result } => {
            let store = config.approval_store();
            let mut entry = store.find(store.identity(), &name)?;
            let path = store.accept(&mut entry, &result)?;
            println!("Accepted {name}: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Complete { name, result } => {
            let store = config.approval_store();
            let mut entry = store.find(store.identity(), &name)?;
            let path = store.complete(&mut entry, &result)?;
            println!("Completed {name}: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch {
            poll_interval,
            reset,
        } => {
            let store = config.approval_store();
            watch(&store, &config, poll_interval, reset).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Purge => {
            let engine = JobEngine::new(config.engine_config(), StandardResolver::new()?);
            engine.purge_workspaces()?;
            println!("Removed all workspaces under {}", config.job_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "jobsite=debug" } else { "jobsite=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Ctrl-C stops the engine: queued jobs are cancelled and children killed.
fn shutdown_on_ctrl_c(engine: &JobEngine<StandardResolver>) {
    let engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping jobs");
            engine.shutdown().await;
        }
    });
}

async fn watch(
    store: &ApprovalStore,
    config: &JobsiteConfig,
    poll_interval: Option<u64>,
    reset: bool,
) -> Result<()> {
    let identity = store.identity().to_string();
    if reset {
        store.reset(&identity)?;
    }
    let interval = poll_interval
        .map(|secs| std::time::Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| config.poll_interval());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    println!(
        "Watching {} every {}s (Ctrl-C to stop)",
        store.stage_dir(&identity, jobsite::Stage::Inbox).display(),
        interval.as_secs()
    );
    let mut watcher = InboxWatcher::new(store.clone(), identity);
    watcher.run(interval, cancel, ui::print_new_job).await?;
    Ok(())
}
