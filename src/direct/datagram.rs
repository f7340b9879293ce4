use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::direct::{DirectTransport, PayloadSink, decode_envelope, encode_envelope};
use crate::protocol::Protocol;
use crate::{Error, Result};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Raw UDP transport. One datagram carries one envelope; delivery is best
/// effort.
#[derive(Default)]
pub struct DatagramTransport {
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
    sender: OnceCell<UdpSocket>,
}

impl DatagramTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectTransport for DatagramTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Datagram
    }

    async fn listen(&self, topic: &str, sink: PayloadSink) -> Result<u16> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let port = socket.local_addr()?.port();
        info!("datagram listener for '{}' on port {}", topic, port);

        let task = tokio::spawn(recv_loop(socket, sink));
        self.listeners.lock().insert(port, task);
        Ok(port)
    }

    async fn send(&self, host: &str, port: u16, topic: &str, payload: &[u8]) -> Result<()> {
        let envelope = encode_envelope(topic, payload)?;
        if envelope.len() > MAX_DATAGRAM_LEN {
            return Err(Error::transport(format!(
                "{} byte envelope does not fit in a datagram",
                envelope.len()
            )));
        }

        let socket = self
            .sender
            .get_or_try_init(|| UdpSocket::bind(("0.0.0.0", 0)))
            .await?;
        socket.send_to(&envelope, (host, port)).await?;
        Ok(())
    }

    fn unlisten(&self, port: u16) {
        if let Some(task) = self.listeners.lock().remove(&port) {
            debug!("closing datagram listener on port {}", port);
            task.abort();
        }
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        for (_, task) in self.listeners.lock().drain() {
            task.abort();
        }
    }
}

async fn recv_loop(socket: UdpSocket, sink: PayloadSink) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => match decode_envelope(&buf[..n]) {
                Ok((topic, payload)) => sink(topic, payload),
                Err(e) => warn!("dropping datagram from {}: {}", from, e),
            },
            Err(e) => {
                warn!("datagram receive failed: {}", e);
                break;
            }
        }
    }
}
