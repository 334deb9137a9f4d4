use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use relay_bus::Connector;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerSettings};
use crate::bus_redis::RedisConnector;
use crate::capabilities::{RobotMemory, TranscriptAnalysis, Watch};
use crate::capability::CapabilityFactory;
use crate::cli::AnnounceArgs;
use crate::collaborator::{Collaborator, CommandCollaborator, NoopCollaborator};
use crate::config::{BrokerConfig, ServiceKind};
use crate::error::BrokerError;
use crate::heartbeat::{spawn_announcer, unix_now, HeartbeatKey, HeartbeatStore};
use crate::identifier::Identifier;
use crate::store::{FrameSource, MemoryStore};
use crate::store_redis::RedisStore;

/// Runs the configured broker until SIGINT/SIGTERM, then shuts it down.
pub async fn serve(config: BrokerConfig) -> Result<()> {
    info!(
        service = ?config.service,
        channel = %config.settings.registration_channel,
        redis_url = %config.redis_url,
        max_in_flight = config.settings.session.max_in_flight,
        "starting relay broker"
    );
    let connector: Arc<dyn Connector> = Arc::new(RedisConnector::open(&config.redis_url)?);
    let store = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("connecting to redis store")?,
    );
    let collaborator = build_collaborator(&config)?;

    match config.service {
        ServiceKind::RobotMemory => {
            let memory: Arc<dyn MemoryStore> = store.clone();
            let factory = move |_: &Identifier| -> Result<RobotMemory, BrokerError> {
                Ok(RobotMemory::new(Arc::clone(&memory)))
            };
            run(factory, connector, store, config.settings).await
        }
        ServiceKind::Sentiment => {
            let factory = move |_: &Identifier| -> Result<TranscriptAnalysis, BrokerError> {
                Ok(TranscriptAnalysis::new(Arc::clone(&collaborator)))
            };
            run(factory, connector, store, config.settings).await
        }
        watcher => {
            let label = watcher
                .watch_label()
                .context("service has no watch label")?;
            let frames: Arc<dyn FrameSource> = store.clone();
            let factory = move |_: &Identifier| -> Result<Watch, BrokerError> {
                Ok(Watch::new(label, Arc::clone(&frames), Arc::clone(&collaborator)))
            };
            run(factory, connector, store, config.settings).await
        }
    }
}

fn build_collaborator(config: &BrokerConfig) -> Result<Arc<dyn Collaborator>> {
    let (Some(command), Some(topic)) = (&config.collaborator, config.service.outcome_topic())
    else {
        if config.service.outcome_topic().is_some() {
            warn!(service = ?config.service, "no collaborator configured; results will not be produced");
        }
        return Ok(Arc::new(NoopCollaborator));
    };
    let collaborator = CommandCollaborator::from_command_line(&command.command, topic)?
        .with_timeout(command.timeout);
    info!(command = %command.command, default_topic = topic, "collaborator configured");
    Ok(Arc::new(collaborator))
}

async fn run<F: CapabilityFactory>(
    factory: F,
    connector: Arc<dyn Connector>,
    heartbeat: Arc<dyn HeartbeatStore>,
    settings: BrokerSettings,
) -> Result<()> {
    let broker = Broker::start(factory, connector, heartbeat, settings)
        .await
        .context("starting broker")?;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            broker.shutdown().await;
            Ok(())
        }
        _ = broker.registration_lost() => {
            broker.shutdown().await;
            bail!("registration subscription lost")
        }
    }
}

/// Device simulator: keeps the heartbeat fresh and re-publishes the
/// identifier on the registration channel every interval.
pub async fn announce(args: AnnounceArgs) -> Result<()> {
    let identifier = Identifier::parse(&args.identifier)?;
    let store: Arc<dyn HeartbeatStore> = Arc::new(
        RedisStore::connect(&args.redis_url)
            .await
            .context("connecting to redis store")?,
    );
    let bus = RedisConnector::open(&args.redis_url)?
        .connect()
        .await
        .context("connecting to redis bus")?;
    let key = HeartbeatKey::for_device(&identifier, args.device_type);
    let interval = Duration::from_millis(args.interval_ms.max(1));

    store
        .beat(&key, unix_now())
        .await
        .context("writing first heartbeat")?;
    info!(
        identifier = %identifier,
        device_type = %args.device_type,
        channel = %args.registration_channel,
        "announcing device"
    );

    let cancel = CancellationToken::new();
    let heartbeat = spawn_announcer(store, key, interval, cancel.clone());
    let registrations = {
        let bus = Arc::clone(&bus);
        let cancel = cancel.clone();
        let channel = args.registration_channel.clone();
        let payload = Bytes::from(identifier.to_string());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = bus.publish(&channel, payload.clone()).await {
                            warn!(channel = %channel, error = %err, "registration publish failed");
                        }
                    }
                }
            }
        })
    };

    shutdown_signal().await;
    cancel.cancel();
    let _ = tokio::join!(heartbeat, registrations);
    if let Err(err) = bus.close().await {
        warn!(error = %err, "closing bus failed");
    }
    info!(identifier = %identifier, "announcer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
