use anyhow::{Context, Result};
use lib_fanout::core::RoomRouter;
use lib_fanout::retrieve::{ApiClient, HttpAccountResolver, HttpIntrospector};
use lib_fanout::upstream::RedisStreamsBroker;
use lib_fanout::{Broker, BrokerConfig, Channel, IdentityDecoder, IdentityGate, RoomSalt};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

mod fanout_logic;
use fanout_logic::config::{IdentitySettings, ModeSettings, Settings};
use fanout_logic::{config, downstream, logger};

const HTTP_RETRIES: u32 = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = dotenvy::dotenv();

    let settings = config::load_config()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Starting server_fanout in {:?} mode", settings.mode);

    let upstream = RedisStreamsBroker::connect(settings.upstream.clone())
        .await
        .context("connecting to the Redis upstream")?;
    let (gate, broker_config) = build_gate(&settings)?;
    let broker = Broker::start(broker_config, Arc::new(upstream));

    let handle = axum_server::Handle::new();
    let mut server = tokio::spawn(downstream::run(
        settings.clone(),
        downstream::AppState::new(broker.clone(), gate),
        handle.clone(),
    ));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server => {
            log::error!("Downstream server exited unexpectedly.");
            broker.close().await;
            return result?;
        }
    }

    // Disconnect every socket and retire upstream subscriptions, then stop accepting.
    broker.close().await;
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    server.await??;

    log::info!("Shutdown complete.");
    Ok(())
}

fn build_gate(settings: &Settings) -> Result<(IdentityGate, BrokerConfig)> {
    match &settings.mode {
        ModeSettings::ClientDeclared => Ok((
            IdentityGate::ClientDeclared,
            BrokerConfig {
                channels: vec![Channel::Price, Channel::Trade, Channel::Status],
                policy: settings.policy,
                stale_after: settings.stale_after,
                router: RoomRouter::default(),
                outbox_capacity: settings.outbox_capacity,
            },
        )),
        ModeSettings::IdentityRouted { salt, accounts_url, decoder } => {
            let salt = RoomSalt::new(salt.clone());
            let decoder = match decoder {
                IdentitySettings::Local => IdentityDecoder::Local,
                IdentitySettings::Introspect { url } => {
                    let client = ApiClient::new(url, settings.http_timeout, HTTP_RETRIES)
                        .context("building the introspection client")?;
                    IdentityDecoder::Introspect(Arc::new(HttpIntrospector::new(client)))
                }
            };
            let accounts = ApiClient::new(accounts_url, settings.http_timeout, HTTP_RETRIES)
                .context("building the accounts client")?;

            Ok((
                IdentityGate::IdentityRouted {
                    decoder,
                    accounts: Arc::new(HttpAccountResolver::new(accounts)),
                    salt: salt.clone(),
                },
                BrokerConfig {
                    channels: vec![Channel::Account],
                    policy: settings.policy,
                    stale_after: settings.stale_after,
                    router: RoomRouter::new(Some(salt)),
                    outbox_capacity: settings.outbox_capacity,
                },
            ))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => log::info!("SIGTERM received, initiating shutdown."),
    }
}
