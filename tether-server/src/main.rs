//! tether server — entry point.
//!
//! A headless dashboard: accepts agents, logs their lifecycle, and
//! requests system information from every endpoint that connects.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_server::service::{ServerService, ServiceDelegate};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "tether remote-administration server")]
struct Cli {
    /// Address to listen on (`host:port`).
    #[arg(short, long, default_value = "0.0.0.0:7777")]
    listen: String,
}

// ── Dashboard delegate ───────────────────────────────────────────

/// Logs service events and greets every new endpoint with a sysinfo
/// request.
#[derive(Default)]
struct Dashboard {
    service: Mutex<Weak<ServerService>>,
}

impl Dashboard {
    fn attach(&self, service: &Arc<ServerService>) {
        *self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(service);
    }

    fn service(&self) -> Option<Arc<ServerService>> {
        self.service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }
}

#[async_trait]
impl ServiceDelegate for Dashboard {
    async fn on_endpoint_connected(&self, endpoint_id: &str) {
        info!(endpoint = %endpoint_id, "endpoint connected");
        if let Some(service) = self.service() {
            let endpoint_id = endpoint_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = service.request_sys_info(&endpoint_id).await {
                    tracing::warn!(endpoint = %endpoint_id, "sysinfo request failed: {e}");
                }
            });
        }
    }

    async fn on_endpoint_disconnected(&self, endpoint_id: &str) {
        info!(endpoint = %endpoint_id, "endpoint disconnected");
    }

    async fn on_response_sys_info(&self, endpoint_id: &str, info: &[String]) {
        for line in info {
            tracing::info!(endpoint = %endpoint_id, "{line}");
        }
    }

    async fn on_upload_file_reply(&self, endpoint_id: &str, ok: bool) {
        info!(endpoint = %endpoint_id, ok, "upload chunk acknowledged");
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dashboard = Arc::new(Dashboard::default());
    let service = ServerService::start(&cli.listen, Arc::clone(&dashboard) as _).await?;
    dashboard.attach(&service);

    info!(listen = %cli.listen, "tether server accepting agents");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.shutdown().await;
    Ok(())
}
