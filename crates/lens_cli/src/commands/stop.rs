//! Stop command - Stop running instances and free the port.

use anyhow::Result;
use lens_supervisor::operations;
use tracing::debug;

use super::{GlobalArgs, Session};

pub async fn execute(global: &GlobalArgs) -> Result<()> {
    let session = Session::open(global)?;
    let result = operations::stop(&session.toolkit, &session.config).await;
    let report = session.finish("stop", result).await?;
    debug!("Terminated: {:?}", report.terminated);
    Ok(())
}
