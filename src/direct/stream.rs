use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::direct::{DirectTransport, PayloadSink, decode_envelope, encode_envelope};
use crate::protocol::Protocol;
use crate::signaling::peer::MAX_FRAME_LEN;
use crate::{Error, Result};

/// Raw TCP transport. Each send opens a connection, writes one
/// length-prefixed envelope and closes; a listener accepts any number of
/// envelopes per connection.
#[derive(Default)]
pub struct StreamTransport {
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectTransport for StreamTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Stream
    }

    async fn listen(&self, topic: &str, sink: PayloadSink) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        info!("stream listener for '{}' on port {}", topic, port);

        let task = tokio::spawn(accept_loop(listener, sink));
        self.listeners.lock().insert(port, task);
        Ok(port)
    }

    async fn send(&self, host: &str, port: u16, topic: &str, payload: &[u8]) -> Result<()> {
        let envelope = encode_envelope(topic, payload)?;
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::transport(format!("connect to {host}:{port}: {e}")))?;

        stream
            .write_all(&(envelope.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&envelope).await?;
        stream.flush().await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    fn unlisten(&self, port: u16) {
        if let Some(task) = self.listeners.lock().remove(&port) {
            debug!("closing stream listener on port {}", port);
            task.abort();
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        for (_, task) in self.listeners.lock().drain() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, sink: PayloadSink) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let sink = sink.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_envelopes(stream, sink).await {
                        warn!("stream from {} failed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("stream accept failed: {}", e);
                break;
            }
        }
    }
}

async fn read_envelopes(mut stream: TcpStream, sink: PayloadSink) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Decode(format!("envelope too large: {len} bytes")));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        let (topic, payload) = decode_envelope(&data)?;
        sink(topic, payload);
    }
}
