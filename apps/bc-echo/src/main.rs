mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use browserchannel::{ChannelServer, CrossDomainInfo, ServerConfig};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "bc-echo")]
#[command(about = "BrowserChannel echo server: every client map comes back as an array")]
struct Cli {
    /// Listen port; overrides BC_ECHO_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(env_filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env();
    init_tracing(&cfg.log_filter);

    let mut server_config = ServerConfig::default();
    if let Some(pattern) = cfg.origin_pattern.as_deref() {
        let prefixes = if cfg.host_prefixes.is_empty() {
            vec![String::new()]
        } else {
            cfg.host_prefixes.clone()
        };
        server_config.cross_domain = Some(
            CrossDomainInfo::new(pattern, prefixes).context("invalid BC_ECHO_ORIGIN pattern")?,
        );
    }

    let server = ChannelServer::with_config(server_config, |channel| async move {
        let sid = channel.session_id();
        info!(sid = %sid, "channel open");
        while let Some(map) = channel.recv_map().await {
            let payload = match serde_json::to_value(&map) {
                Ok(value) => value,
                Err(err) => {
                    warn!(sid = %sid, error = %err, "map does not serialize");
                    continue;
                }
            };
            if let Err(err) = channel.send_array(payload) {
                warn!(sid = %sid, error = %err, "echo failed");
                break;
            }
        }
        info!(sid = %sid, "channel handler done");
    });

    let app = server.router().layer(TraceLayer::new_for_http());

    let port = cli.port.unwrap_or(cfg.port);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "bc-echo listening");

    axum::serve(listener, app.into_make_service())
        .await
        .context("server exited")?;
    Ok(())
}
