use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use shoal::config::{Config, ConfigError};
use shoal::irc::server;

/// A single-node IRC server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the listen address, e.g. 127.0.0.1:6667
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    // A missing file means defaults; a broken file is fatal.
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "no configuration at {}; using defaults",
                args.config.display()
            );
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(bind) = &args.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .ok_or("--bind expects host:port")?;
        config.server.listen.host = host.to_owned();
        config.server.listen.port = port.parse()?;
    }

    info!(
        "{} starting on {} (network: {})",
        config.server.version, config.server.listen.port, config.server.network
    );

    let running = server::start(config, Some(args.config)).await?;

    let server = running.server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            server.begin_shutdown();
        }
    });

    for handle in running.handles {
        let _ = handle.await;
    }

    Ok(())
}
