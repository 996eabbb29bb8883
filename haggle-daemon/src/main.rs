// haggled: application-facing half of the haggle daemon.

use anyhow::Context;
use haggle_daemon::config;
use haggle_daemon::pidfile::PidFile;
use haggle_daemon::Server;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("haggled {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = Server::bind(&cfg)
            .await
            .with_context(|| format!("Failed to listen on {}", cfg.listen_addr()))?;
        let _pid = PidFile::create(&cfg.pid_file)?;
        info!(version = VERSION, pid_file = %cfg.pid_file.display(), "haggled started");
        let handle = server.handle();
        let mut running = tokio::spawn(server.run());
        tokio::select! {
            res = &mut running => res??,
            res = shutdown_signal() => {
                res?;
                info!("signal received");
                handle.shutdown();
                running.await??;
            }
        }
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
