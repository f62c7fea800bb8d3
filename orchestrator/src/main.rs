use anyhow::Context;
use clap::Parser;
use orchestrator::{init_logging, Cli, Orchestrator};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load().context("invalid configuration")?;

    let _log_guard = init_logging(&config.logging).context("failed to initialize logging")?;

    info!(
        proxy = %config.proxy.listen_address,
        admin = %config.admin_address,
        database = %config.database.url,
        method = %config.proxy.capture.method_filter,
        session_save = config.session_save,
        "Interceptor starting"
    );

    Orchestrator::new(config)
        .start()
        .await
        .context("interceptor stopped with an error")?;

    Ok(())
}
