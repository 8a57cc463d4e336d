//! The worker executable a backend launches inside its isolation boundary.

use clap::Parser;
use exoworker::WorkerArgs;
use exowire::shutdown;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wasmtime=warn,cranelift=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = WorkerArgs::parse();
    tracing::info!(directory_port = args.directory_port, code_source = %args.code_source.display(), "worker starting");

    let (trigger, signal) = shutdown::channel();
    tokio::spawn(async move {
        terminated().await;
        tracing::info!("termination requested");
        trigger.trigger();
    });

    exoworker::bootstrap::run(args.into(), signal).await?;
    Ok(())
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot watch for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminated() {
    let _ = tokio::signal::ctrl_c().await;
}
