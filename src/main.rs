//! CLI for meshsub
//!
//! Subcommands:
//! - `broker`: run the control broker
//! - `subscribe`: join the network and print what arrives on a topic
//! - `publish`: join the network, publish one payload and leave

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meshsub::broker::Broker;
use meshsub::config::{Settings, load_config};
use meshsub::control::WsControlClient;
use meshsub::persistence::RetainedStore;
use meshsub::transport::BrokerServer;
use meshsub::{Callback, Dispatcher, Message, NodeEvent, Protocol, QoS};
use parking_lot::Mutex;
use tracing::{error, info, warn};

/// How long `publish` waits for discovery to produce a route.
const ROUTE_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "meshsub")]
enum Command {
    /// Run the control broker
    Broker,
    /// Subscribe to a topic and log every message until ctrl-c
    Subscribe {
        #[arg(long)]
        topic: String,
        /// broker, stream, datagram or peer-rtc
        #[arg(long, default_value = "broker")]
        protocol: Protocol,
    },
    /// Publish one payload to a topic
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
        #[arg(long, default_value = "broker")]
        protocol: Protocol,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    meshsub::utils::logging::init("info");

    let cmd = Command::parse();

    let result = match cmd {
        Command::Broker => run_broker().await,
        Command::Subscribe { topic, protocol } => run_subscribe(&topic, protocol).await,
        Command::Publish {
            topic,
            payload,
            protocol,
        } => run_publish(&topic, payload.as_bytes(), protocol).await,
    };
    if let Err(e) = result {
        error!("meshsub failed: {}", e);
    }
}

async fn run_broker() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let store = RetainedStore::open(&config.server.retained_path)?;
    let broker = Arc::new(Mutex::new(Broker::new(store)));
    let server = BrokerServer::bind(&addr, broker).await?;

    tokio::select! {
        _ = server.serve() => {
            error!("control broker exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn join(config: &Settings) -> meshsub::Result<Dispatcher> {
    let control = Arc::new(WsControlClient::new(config.node.id.clone()));
    let dispatcher = Dispatcher::new(config, control);
    dispatcher
        .connect(&config.broker.host, config.broker.port)
        .await?;
    Ok(dispatcher)
}

fn log_events(dispatcher: &Dispatcher) {
    let mut events = dispatcher.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::ConnectionFailure { .. }
                | NodeEvent::TransportFailure { .. }
                | NodeEvent::ControlDisconnected { .. } => warn!("{:?}", event),
                other => info!("{:?}", other),
            }
        }
    });
}

async fn run_subscribe(
    topic: &str,
    protocol: Protocol,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let dispatcher = join(&config).await?;
    log_events(&dispatcher);

    let callback: Callback = Arc::new(|msg: &Message| {
        info!(
            "[{}] via {}: {}",
            msg.topic,
            msg.protocol,
            String::from_utf8_lossy(&msg.payload)
        );
    });
    dispatcher
        .subscribe(topic, callback, protocol.into(), QoS::AtMostOnce)
        .await?;
    info!("listening on '{}', ctrl-c to stop", topic);

    tokio::signal::ctrl_c().await?;
    dispatcher.disconnect().await?;
    Ok(())
}

async fn run_publish(
    topic: &str,
    payload: &[u8],
    protocol: Protocol,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let dispatcher = join(&config).await?;
    let mut events = dispatcher.events();

    let deadline = tokio::time::Instant::now() + ROUTE_WAIT;
    while dispatcher.routes(topic).is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if dispatcher.routes(topic).is_empty() {
        warn!("no subscriber announced '{}'", topic);
    }

    dispatcher
        .publish(topic, payload, protocol.into(), QoS::AtMostOnce, false)
        .await?;

    if protocol.is_connection_oriented() && !dispatcher.routes(topic).is_empty() {
        // Queued frames go out once the session is ready.
        let settled = tokio::time::timeout(ROUTE_WAIT, async {
            while let Ok(event) = events.recv().await {
                match event {
                    NodeEvent::SessionReady { .. } => return true,
                    NodeEvent::ConnectionFailure { .. } => return false,
                    _ => {}
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        if !settled {
            warn!("peer session for '{}' did not become ready", topic);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("published {} bytes to '{}'", payload.len(), topic);
    dispatcher.disconnect().await?;
    Ok(())
}
