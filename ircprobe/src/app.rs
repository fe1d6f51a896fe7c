use std::process::ExitCode;

use anyhow::Result;
use ircprobe_core::{Config, Harness, HarnessError, Outcome, RunReport};
use tokio::signal;
use tracing::{info, warn};

pub async fn run(config: Config) -> Result<ExitCode> {
    let harness = match Harness::with_docker(config) {
        Ok(harness) => harness,
        Err(e) => {
            eprintln!("ircprobe: {e}");
            return Ok(ExitCode::from(e.exit_code()));
        }
    };

    info!(
        server = %harness.server().name,
        address = %harness.server().address(),
        "Run {} prepared",
        harness.run_id()
    );

    let report = harness.run_until(shutdown_signal()).await;
    print_report(&report);
    Ok(ExitCode::from(report.exit_code()))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

// A handler that failed to install must never look like a signal.
async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

fn print_report(report: &RunReport) {
    for failure in &report.cleanup {
        warn!("{failure}; server {} may need manual removal", report.server_name);
    }
    if let Some(dir) = &report.artifact_dir {
        println!("artifacts: {}", dir.display());
    }

    match &report.outcome {
        Outcome::Success => {
            println!("PASS {} ({})", report.run_id, report.address);
        }
        Outcome::Failure { stage, error } => {
            println!("FAIL {} at {stage}: {error}", report.run_id);
            if let HarnessError::MissingExpectedContent { content, .. } = error {
                println!("--- receiver output ---");
                print!("{content}");
                if !content.ends_with('\n') {
                    println!();
                }
                println!("--- end receiver output ---");
            }
        }
    }
}
