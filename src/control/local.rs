use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::broker::message::{Message, Will};
use crate::client::Client;
use crate::control::{ControlChannel, DeliverySink, LinkLostSink};
use crate::protocol::QoS;
use crate::transport::message::ServerFrame;
use crate::{Error, Result};

/// Control-channel client attached directly to a `Broker` in the same
/// process. Host and port passed to `connect` are ignored.
pub struct LocalControlClient {
    client_id: String,
    broker: Arc<Mutex<Broker>>,
    sink: Arc<RwLock<Option<DeliverySink>>>,
    link_lost: RwLock<Option<LinkLostSink>>,
    will: Mutex<Option<Will>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl LocalControlClient {
    pub fn new(client_id: impl Into<String>, broker: Arc<Mutex<Broker>>) -> Self {
        Self {
            client_id: client_id.into(),
            broker,
            sink: Arc::new(RwLock::new(None)),
            link_lost: RwLock::new(None),
            will: Mutex::new(None),
            forwarder: Mutex::new(None),
        }
    }

    /// Drops the connection the way a crashed process would: the broker
    /// publishes the will and the link-lost sink fires.
    pub fn abort(&self) {
        let Some(forwarder) = self.forwarder.lock().take() else {
            return;
        };
        forwarder.abort();
        self.broker.lock().cleanup_client(&self.client_id, false);
        let link_lost = self.link_lost.read().clone();
        if let Some(link_lost) = link_lost {
            link_lost("connection aborted");
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl ControlChannel for LocalControlClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn set_sink(&self, sink: DeliverySink) {
        *self.sink.write() = Some(sink);
    }

    fn set_link_lost_sink(&self, sink: LinkLostSink) {
        *self.link_lost.write() = Some(sink);
    }

    fn set_will(&self, will: Option<Will>) {
        *self.will.lock() = will;
    }

    fn is_connected(&self) -> bool {
        self.forwarder.lock().is_some() && self.broker.lock().has_client(&self.client_id)
    }

    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let mut forwarder = self.forwarder.lock();
        if forwarder.is_some() {
            return Ok(());
        }
        debug!(
            "{} attaching to in-process broker (ignoring {}:{})",
            self.client_id, host, port
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        let client = Client::with_id(self.client_id.clone(), tx).with_will(self.will.lock().clone());
        self.broker.lock().register_client(client);

        let sink = self.sink.clone();
        *forwarder = Some(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    ServerFrame::Deliver(message) => {
                        let sink = sink.read().clone();
                        if let Some(sink) = sink {
                            sink(message);
                        }
                    }
                    ServerFrame::Error { reason } => warn!("broker reported: {}", reason),
                    ServerFrame::ConnAck { .. } => {}
                }
            }
        }));
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.ensure_connected()?;
        self.broker.lock().publish(message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.ensure_connected()?;
        self.broker
            .lock()
            .subscribe(filter, self.client_id.clone(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.ensure_connected()?;
        self.broker.lock().unsubscribe(filter, &self.client_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.forwarder.lock().take().is_some() {
            self.broker.lock().cleanup_client(&self.client_id, true);
        }
        Ok(())
    }
}
