//! Start command - Provision, launch and supervise the server.

use anyhow::Result;
use lens_supervisor::{Orchestrator, RunOutcome};
use tracing::info;

use super::{shutdown_signal, GlobalArgs, Session};

pub async fn execute(global: &GlobalArgs) -> Result<()> {
    let session = Session::open(global)?;
    let mut orchestrator = Orchestrator::new(session.config.clone(), session.toolkit.clone());
    info!("Run {} starting", orchestrator.run_id());

    let result = orchestrator.start(shutdown_signal()).await;
    let summary = session.finish("start", result).await?;

    match summary.outcome {
        RunOutcome::Exited(exit) if summary.exit_code() != 0 => {
            anyhow::bail!("Server exited unexpectedly with {}", exit)
        }
        _ => Ok(()),
    }
}
