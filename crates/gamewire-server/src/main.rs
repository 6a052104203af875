//! The gamewire server binary: loads config, initializes logging, and runs the
//! acceptor until Ctrl-C.

mod protocol;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gamewire_config::{CliArgs, Config, default_config_dir};
use gamewire_net::notices::{NOTIFY_SOCKET_CLOSED, NotifySocketClosed};
use gamewire_net::{
    Acceptor, Connection, ConnectionBuilder, MessageReceiver, NetContext, Outcome,
    ReconnectConfig, ReconnectPolicy, TcpTransportFactory, spawn_registry_sweeper,
};
use tokio::sync::watch;

/// How often the shared heartbeat scheduler checks connection timers.
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("config"));

    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {e}, using defaults",
                config_dir.display()
            );
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    gamewire_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions) && config.debug.file_logging,
        Some(&config),
    );

    let acceptor_config = match settings::acceptor_config(&config) {
        Ok(acceptor_config) => acceptor_config,
        Err(e) => {
            tracing::error!("invalid bind address {}: {e}", config.server.bind_address);
            return ExitCode::FAILURE;
        }
    };

    let context = NetContext::new(HEARTBEAT_TICK);
    let mut table = context.handler_table();
    protocol::register_handlers(&mut table);
    tracing::info!("{} message handlers registered", table.len());

    let acceptor = Arc::new(Acceptor::new(acceptor_config, Arc::clone(&context)));
    acceptor.add_receiver(table.into_receiver("handlers"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(ttl) = config.registry.suspended_ttl_secs {
        spawn_registry_sweeper(
            Arc::clone(context.registry()),
            Duration::from_secs(ttl),
            Duration::from_secs(config.registry.sweep_interval_secs.max(1)),
            shutdown_rx,
        );
    }

    let upstream = match config.server.upstream.as_deref() {
        Some(upstream) => connect_upstream(&context, &config, upstream).await,
        None => None,
    };

    let signal_acceptor = Arc::clone(&acceptor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            signal_acceptor.shutdown();
        }
    });

    let result = acceptor.run().await;

    shutdown_tx.send_replace(true);
    if let Some(upstream) = upstream {
        upstream.close_socket(Outcome::Ok);
    }
    context.heartbeat().shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("listener failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Open the outbound link to the backend server. Reconnects with backoff
/// whenever the link drops or a send finds it offline.
async fn connect_upstream(
    context: &Arc<NetContext>,
    config: &Config,
    upstream: &str,
) -> Option<Arc<Connection>> {
    let Some((host, port)) = settings::parse_upstream(upstream) else {
        tracing::error!("upstream {upstream:?} is not host:port, skipping");
        return None;
    };

    let reconnect = settings::reconnect_config(&config.reconnect);
    let factory = TcpTransportFactory::new(
        Default::default(),
        settings::frame_config(&config.connection),
    );
    let connection = ConnectionBuilder::new(Arc::clone(context))
        .config(settings::connection_config(&config.connection))
        .policy(Arc::new(ReconnectPolicy::new(reconnect.clone())))
        .connector(Arc::new(factory));

    let watcher = Arc::new(MessageReceiver::direct("upstream"));
    let weak = Arc::downgrade(&connection);
    let retry = reconnect.clone();
    watcher.register_handler(NOTIFY_SOCKET_CLOSED, move |packet| {
        let reason = packet
            .decode_message::<NotifySocketClosed>()
            .map(|notice| notice.outcome)
            .unwrap_or_default();
        if reason.is_fail()
            && let Some(connection) = weak.upgrade()
        {
            tracing::warn!("upstream lost: {reason}");
            spawn_reconnect(connection, retry.clone());
        }
    });
    connection.register_message_receiver(watcher);

    let outcome = connection.create_raw_socket(&host, port).await;
    if outcome.is_fail() {
        tracing::error!("upstream {upstream}: {outcome}");
        return Some(connection);
    }
    let outcome = connection.connect().await;
    if outcome.is_fail() {
        tracing::warn!("upstream {upstream}: {outcome}, retrying in background");
        spawn_reconnect(Arc::clone(&connection), reconnect);
    }
    Some(connection)
}

fn spawn_reconnect(connection: Arc<Connection>, config: ReconnectConfig) {
    tokio::spawn(async move {
        if let Err(e) = gamewire_net::reconnection::reconnect_loop(&connection, config).await {
            tracing::error!("[{}] upstream: {e}", connection.id());
        }
    });
}
