//! Process signal handling

use tokio::signal;
use tracing::{error, info};

/// Completes when the process receives SIGINT or SIGTERM
///
/// If a handler cannot be installed the error is logged and that signal is
/// never observed; the other one still works.
///
/// # Examples
///
/// ```no_run
/// use beast_agent::{AgentConfig, AgentRuntime, shutdown_signal};
///
/// # async fn run() -> beast_agent::AgentResult<()> {
/// let config = AgentConfig::from_env()?;
/// let mut runtime = AgentRuntime::builder(config).build()?;
/// runtime.run_until(shutdown_signal()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
