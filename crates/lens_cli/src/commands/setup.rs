//! Setup command - Provision the environment without starting the server.

use anyhow::Result;
use lens_supervisor::Orchestrator;

use super::{GlobalArgs, Session};

pub async fn execute(global: &GlobalArgs) -> Result<()> {
    let session = Session::open(global)?;
    let mut orchestrator = Orchestrator::new(session.config.clone(), session.toolkit.clone());
    let result = orchestrator.setup().await;
    session.finish("setup", result).await
}
