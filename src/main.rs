use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use petrel_tftpd::audit::AuditLogger;
use petrel_tftpd::config::{self, LogFormat, ServerConfig};
use petrel_tftpd::error::Result;
use petrel_tftpd::monitor::Monitor;
use petrel_tftpd::server::TftpServer;

#[derive(Parser, Debug)]
#[command(name = "petrel-tftpd", about = "Standalone TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/petrel/tftpd.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Enable write requests (overrides the config file)
    #[arg(long)]
    allow_writes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        ServerConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.filesystem.root_directory = root_dir;
    }
    if let Some(bind) = cli.bind {
        config.network.listen_address = bind.ip();
        config.network.listen_port = bind.port();
        config.network.ipv6_enabled = bind.is_ipv6();
    }
    if cli.allow_writes {
        config.security.write_enabled = true;
    }

    if cli.init_config {
        config::write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.filesystem.root_directory).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.filesystem.root_directory).await?;
    }

    if cli.check_config {
        config::validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    config::validate_config(&config, false)?;

    let _log_guard = init_logging(&config)?;

    if config.logging.audit_enabled {
        AuditLogger::server_started(
            &format!(
                "{}:{}",
                config.network.listen_address, config.network.listen_port
            ),
            &config.filesystem.root_directory.display().to_string(),
        );
    }

    let config = Arc::new(config);
    let monitor = Arc::new(Monitor::new());
    let server = TftpServer::bind(Arc::clone(&config), Arc::clone(&monitor)).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; shutting down");
                shutdown.shutdown();
            }
            Err(e) => error!(error = %e, "failed to install signal handler"),
        }
    });

    server.run().await?;
    info!("final metrics: {}", monitor.to_json());
    Ok(())
}

fn init_logging(
    config: &ServerConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::new(config.logging.level.clone());

    if let Some(ref log_file) = config.logging.file {
        let dir = match log_file.parent() {
            Some(path) => path,
            None => std::path::Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                petrel_tftpd::TftpError::Config(
                    "logging.file must include a file name".to_string(),
                )
            })?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
        }
        Ok(Some(guard))
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
        Ok(None)
    }
}
