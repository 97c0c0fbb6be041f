use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use jiff::SignedDuration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use swdfleet_server::api::security::{IpRateLimiter, LoginGuard};
use swdfleet_server::auth::OperatorAuth;
use swdfleet_server::config::{self, Config};
use swdfleet_server::service::Service;
use swdfleet_server::store::StateStore;
use swdfleet_server::{AppState, api, serve, tls};

#[derive(Parser)]
#[command(name = "swdfleet-server")]
#[command(about = "LTE/SWD fleet manager control plane")]
struct Cli {
    /// Override the plain-HTTP listen address (HTTP_ADDR)
    #[arg(long)]
    http_addr: Option<String>,

    /// Override the state snapshot file (DATA_FILE)
    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Override the static panel directory (STATIC_DIR)
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "swdfleet_server=info,tower_http=warn".to_owned());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(addr) = cli.http_addr {
        config.http_addr = config::parse_listen_addr(&addr)?;
    }
    if let Some(path) = cli.data_file {
        config.data_file = path;
    }
    if let Some(dir) = cli.static_dir {
        config.static_dir = dir;
    }
    let config = Arc::new(config);

    let store = Arc::new(StateStore::load(&config.data_file, config.fleet_limit).await?);
    info!(
        devices = store.device_count().await,
        data_file = %config.data_file.display(),
        "state loaded"
    );

    let auth = Arc::new(OperatorAuth::new(
        config.operator_password.clone(),
        config.operator_token_ttl,
    ));
    let service = Arc::new(Service::new(config.clone(), store, auth));

    let state = AppState {
        service,
        api_limiter: Arc::new(IpRateLimiter::new(
            config.api_rate_per_minute,
            SignedDuration::from_secs(60),
        )),
        login_guard: Arc::new(LoginGuard::new(
            config.login_rate_per_minute,
            config.login_burst,
        )),
        config: config.clone(),
    };
    let app = api::router(state);

    let (listen_addr, acceptor) = match (&config.https_addr, &config.tls_cert_file, &config.tls_key_file)
    {
        (Some(addr), Some(cert_file), Some(key_file)) => {
            let tls_config = tls::server_config(cert_file, key_file)?;
            (*addr, Some(TlsAcceptor::from(Arc::new(tls_config))))
        }
        _ => (config.http_addr, None),
    };

    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, tls = acceptor.is_some(), static_dir = %config.static_dir.display(), "listening");

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    serve::serve(listener, app, acceptor, cancel).await;

    info!("shutdown complete");
    Ok(())
}

/// Cancels the token on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("termination signal received");
    cancel.cancel();
}
