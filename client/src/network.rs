use crate::peers::PeerTable;
use log::{debug, info, warn};
use shared::framing::{ConnectionReader, ReadEvent};
use shared::{
    encode, RelayError, StateMessage, WireMessage, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, MAX_LINE_LEN,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_line_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_line_len: MAX_LINE_LEN,
        }
    }
}

/// Connection to a relay server.
///
/// Sends are best-effort and never fail the caller; a background task keeps
/// the peer table current from the batches the server broadcasts.
pub struct RelayClient {
    id: String,
    server_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    peers: Arc<RwLock<PeerTable>>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
}

impl RelayClient {
    pub async fn connect(host: &str, port: u16, id: impl Into<String>) -> Result<Self, RelayError> {
        Self::connect_with_config(host, port, id, ClientConfig::default()).await
    }

    /// Connects within `config.connect_timeout` and starts the receive task.
    pub async fn connect_with_config(
        host: &str,
        port: u16,
        id: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, RelayError> {
        let addr = format!("{}:{}", host, port);
        let stream = match timeout(config.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(RelayError::Connect { addr, source }),
            Err(_) => {
                return Err(RelayError::Connect {
                    addr,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection within {:?}", config.connect_timeout),
                    ),
                })
            }
        };

        let server_addr = stream
            .peer_addr()
            .map_err(|source| RelayError::Connect {
                addr: addr.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let id = id.into();
        info!("Connected to relay {} as '{}'", server_addr, id);

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let peers = Arc::new(RwLock::new(PeerTable::new(id.clone())));
        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let receive_task = tokio::spawn(receive_loop(
            ConnectionReader::new(read_half, config.read_timeout, config.max_line_len),
            server_addr,
            Arc::clone(&writer),
            Arc::clone(&peers),
            Arc::clone(&running),
            cancel.clone(),
        ));

        Ok(RelayClient {
            id,
            server_addr,
            writer,
            peers,
            running,
            stopped: AtomicBool::new(false),
            cancel,
            receive_task: Mutex::new(Some(receive_task)),
            write_timeout: config.write_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// False once the server closed the connection or `stop` was called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Sends our position and heading.
    pub async fn send_state(&self, x: f64, y: f64, ang: f64) {
        self.send(StateMessage::new(self.id.clone(), x, y, ang)).await;
    }

    /// Sends a full state record, e.g. one carrying velocity. The id is
    /// always replaced with this client's own.
    pub async fn send(&self, mut state: StateMessage) {
        if !self.is_running() {
            debug!("Relay connection is down, dropping state update");
            return;
        }
        state.id.clone_from(&self.id);

        let line = match encode(&WireMessage::State(state)) {
            Ok(line) => line,
            Err(e) => {
                warn!("Not sending state: {}", e);
                return;
            }
        };

        if let Err(e) = self.write_line(&line).await {
            warn!("Failed to send state: {}", e);
        }
    }

    async fn write_line(&self, line: &[u8]) -> Result<(), RelayError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line).await
        };

        let result = match timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };
        result.map_err(|source| RelayError::Io {
            peer: self.server_addr,
            source,
        })
    }

    /// Snapshot of every known peer's latest state.
    pub async fn peers(&self) -> HashMap<String, StateMessage> {
        self.peers.read().await.states()
    }

    /// Forgets peers that no batch has mentioned for longer than `max_age`.
    pub async fn prune_stale(&self, max_age: Duration) -> Vec<String> {
        let removed = self.peers.write().await.prune_stale(max_age, Instant::now());
        for id in &removed {
            info!("Peer '{}' expired", id);
        }
        removed
    }

    /// Stops the receive task and closes the connection. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(task) = self.receive_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Receive task ended abnormally: {}", e);
            }
        }
        shutdown_writer(&self.writer).await;
        self.running.store(false, Ordering::SeqCst);
        info!("Disconnected from relay {}", self.server_addr);
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    mut reader: ConnectionReader<OwnedReadHalf>,
    server_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    peers: Arc<RwLock<PeerTable>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = reader.next_event() => event,
        };

        match event {
            Ok(ReadEvent::Messages(messages)) => {
                for message in messages {
                    match message {
                        WireMessage::Batch(batch) => {
                            peers
                                .write()
                                .await
                                .apply_batch(batch.messages, Instant::now());
                        }
                        WireMessage::State(state) => {
                            debug!("Ignoring bare state for '{}' from relay", state.id);
                        }
                    }
                }
            }
            Ok(ReadEvent::Idle) => continue,
            Ok(ReadEvent::Closed) => {
                info!("Relay {} closed the connection", server_addr);
                break;
            }
            Err(e) => {
                warn!("Lost connection to relay {}: {}", server_addr, e);
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    shutdown_writer(&writer).await;
}

async fn shutdown_writer(writer: &Mutex<OwnedWriteHalf>) {
    let shutdown = async { writer.lock().await.shutdown().await };
    match timeout(DEFAULT_WRITE_TIMEOUT, shutdown).await {
        Ok(Ok(())) | Err(_) => {}
        Ok(Err(e)) => debug!("Error shutting down relay connection: {}", e),
    }
}
