//! splice-http server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ───────────────▶ http::server ──▶ HttpReq (lazy decode) ──▶ handler
//!                                                                    │
//!                                          attaches child operations │
//!                                                                    ▼
//!                     ┌──────────────┬───────────────┬──────────────────┐
//!                     │  http::file  │ subtask::proxy│  subtask::query  │
//!                     │ read / save  │ outbound HTTP │   MySQL client   │
//!                     └──────────────┴───────────────┴──────────────────┘
//!                                                                    │
//!     Client Response                  completions edit the response │
//!     ◀─────────────── Reply (finish hooks) ◀── HttpResp ◀───────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use splice_http::config::{load_config, ServerConfig};
use splice_http::observability::{logging, metrics};
use splice_http::HttpServer;

#[derive(Parser)]
#[command(name = "splice-http")]
#[command(about = "HTTP server with file, proxy and MySQL child operations", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!("splice-http v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        upstream = config.proxy.upstream.as_deref().unwrap_or("-"),
        mysql = config.mysql.url.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(config);
    server.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
