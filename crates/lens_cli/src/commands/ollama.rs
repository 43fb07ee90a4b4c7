//! Ollama command - Show, list, verify or configure the integration.

use anyhow::Result;
use clap::Args;
use lens_supervisor::{operations, Orchestrator, SupervisorError};

use super::{GlobalArgs, Session};

#[derive(Args, Debug)]
pub struct OllamaArgs {
    /// List the models available locally
    #[arg(long)]
    pub list_models: bool,

    /// Verify the server and the configured model
    #[arg(long)]
    pub verify: bool,
}

pub async fn execute(args: OllamaArgs, global: &GlobalArgs) -> Result<()> {
    let mut session = Session::open(global)?;

    if global.changes_ollama() {
        let result = operations::configure_ollama(
            &session.toolkit,
            &mut session.config,
            global.ollama_host.as_deref(),
            global.ollama_model.as_deref(),
        )
        .map_err(SupervisorError::from);
        session.finish("ollama", result).await?;
        return verify(&session).await;
    }

    if args.list_models {
        operations::list_models(&session.toolkit).await;
        return Ok(());
    }

    if args.verify {
        return verify(&session).await;
    }

    operations::show_ollama_config(&session.toolkit, &session.config);
    Ok(())
}

async fn verify(session: &Session) -> Result<()> {
    let mut orchestrator = Orchestrator::new(session.config.clone(), session.toolkit.clone());
    let result = orchestrator.verify_external_service().await;
    let available = session.finish("ollama", result).await?;
    if !available && session.config.ollama.enabled {
        anyhow::bail!("Ollama is not available");
    }
    Ok(())
}
