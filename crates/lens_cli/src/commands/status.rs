//! Status command - Show port, process and environment state.

use anyhow::Result;
use lens_supervisor::operations;

use super::{GlobalArgs, Session};

pub async fn execute(global: &GlobalArgs) -> Result<()> {
    let session = Session::open(global)?;
    let report = operations::status(&session.toolkit, &session.config).await;
    report.log_to(session.toolkit.sink.as_ref());
    Ok(())
}
