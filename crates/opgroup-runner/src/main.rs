/*
[INPUT]:  CLI arguments, YAML plan file, OS shutdown signals
[OUTPUT]: Plan steps run to completion on an operation queue, failures logged
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use opgroup_core::{Operation, OperationQueue};
use opgroup_runner::{PlanConfig, StepOutcome, build_operation, failure_lines};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "opgroup-runner", version, about = "Run a plan of grouped operations")]
struct Cli {
    #[arg(long = "plan", value_name = "PATH")]
    plan_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        plan_path = %args.plan_path.display(),
        dry_run = args.dry_run,
        "starting opgroup-runner"
    );

    let plan = load_plan(&args.plan_path)?;
    info!(
        steps = plan.steps.len(),
        total = plan.step_count(),
        queue = %plan.queue.name,
        "plan loaded"
    );

    if args.dry_run {
        info!("dry-run requested; plan validated");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let queue = OperationQueue::new(plan.queue.clone());
    let ops: Vec<Arc<dyn Operation>> = plan.steps.iter().map(build_operation).collect();
    for op in &ops {
        queue
            .add(op.clone())
            .with_context(|| format!("enqueue step {}", op.name()))?;
    }
    info!(count = ops.len(), "steps enqueued");

    tokio::select! {
        _ = queue.wait_until_empty() => {
            info!("all steps finished");
        }
        _ = shutdown.cancelled() => {
            warn!("shutdown signal received, cancelling steps");
            queue.cancel_all();
            if tokio::time::timeout(SHUTDOWN_GRACE, queue.wait_until_empty()).await.is_err() {
                error!(remaining = queue.operation_count(), "steps did not stop in time");
            }
        }
    }

    report(&ops)
}

fn report(ops: &[Arc<dyn Operation>]) -> Result<()> {
    let mut failed = 0;
    for outcome in ops.iter().map(|op| StepOutcome::of(op.as_ref())) {
        if outcome.is_success() {
            info!(step = %outcome.name, "step succeeded");
            continue;
        }
        failed += 1;
        match &outcome.error {
            Some(err) => {
                for line in failure_lines(err) {
                    error!(step = %outcome.name, "{line}");
                }
            }
            None => error!(step = %outcome.name, "step did not finish"),
        }
    }

    if failed > 0 {
        bail!("{failed} of {} steps failed", ops.len());
    }
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_plan(path: &Path) -> Result<PlanConfig> {
    PlanConfig::from_file(path).context("load plan")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
