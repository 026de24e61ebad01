use super::Args;
use anyhow::Context;
use snippet_daemon::config::DaemonConfig;
use snippet_daemon::demo::{demo_codec, demo_units};
use snippet_rpc::{builtin_units, Dispatcher, Registry, ServerOptions, SessionServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub(super) struct BootstrapContext {
    pub(super) addr: SocketAddr,
    pub(super) listener: TcpListener,
    pub(super) server: Arc<SessionServer>,
    pub(super) secret: Option<String>,
}

/// Loads the config file, if any, and lets command-line flags override it.
pub(super) fn resolve_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen = Some(listen.clone());
    }
    if args.require_handshake {
        config.require_handshake = true;
    }
    if let Some(level) = args.capability_level {
        config.capability_level = Some(level);
    }
    Ok(config)
}

pub(super) fn build_server(config: &DaemonConfig) -> anyhow::Result<Arc<SessionServer>> {
    let mut units = builtin_units();
    units.extend(demo_units());
    let registry = Registry::build(units).context("invalid snippet registry")?;
    log::debug!("snippetd: registered {} methods", registry.len());

    let mut builder = Dispatcher::builder(registry)
        .events(Arc::new(config.event_cache()))
        .codec(demo_codec());
    if let Some(level) = config.capability_level {
        builder = builder.capability_level(level);
    }
    let dispatcher = builder.build().context("failed to build dispatcher")?;
    let options = ServerOptions { secret: config.handshake_secret() };
    Ok(SessionServer::new(dispatcher, options))
}

pub(super) async fn bootstrap(args: Args) -> anyhow::Result<BootstrapContext> {
    let config = resolve_config(&args)?;
    let server = build_server(&config)?;
    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    let addr = listener.local_addr()?;
    let secret = server.options().secret.clone();
    Ok(BootstrapContext { addr, listener, server, secret })
}
