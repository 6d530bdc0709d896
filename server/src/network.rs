//! Server network layer: accept loop, per-connection readers and the
//! fixed-tick broadcast

use crate::registry::{ConnId, ConnWriter, ConnectionRecord, ConnectionRegistry};
use bytes::Bytes;
use log::{debug, error, info, warn};
use shared::framing::{ConnectionReader, ReadEvent};
use shared::{
    encode, BatchMessage, RelayError, StateMessage, WireMessage, DEFAULT_READ_TIMEOUT,
    DEFAULT_TICK_INTERVAL, DEFAULT_WRITE_TIMEOUT, MAX_LINE_LEN,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Tuning knobs for a relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Period of the broadcast loop
    pub tick_interval: Duration,
    /// Upper bound on a single read before the reader reports idle
    pub read_timeout: Duration,
    /// Upper bound on writing one batch to one connection
    pub write_timeout: Duration,
    /// Longest line accepted from a client
    pub max_line_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_line_len: MAX_LINE_LEN,
        }
    }
}

/// A running relay: accepts connections, stores each one's latest state and
/// fans the merged snapshot out to everyone once per tick
pub struct RelayServer {
    local_addr: SocketAddr,
    registry: Arc<RwLock<ConnectionRegistry>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    running: AtomicBool,
}

impl RelayServer {
    /// Binds `bind_address:port` with the default configuration
    pub async fn start(bind_address: &str, port: u16) -> Result<Self, RelayError> {
        Self::start_with_config(bind_address, port, ServerConfig::default()).await
    }

    /// Binds the listener and spawns the accept and broadcast loops
    ///
    /// Port 0 picks an ephemeral port; see [`RelayServer::local_addr`].
    pub async fn start_with_config(
        bind_address: &str,
        port: u16,
        config: ServerConfig,
    ) -> Result<Self, RelayError> {
        let bind_error = |source: io::Error| RelayError::Bind {
            addr: format!("{}:{}", bind_address, port),
            source,
        };

        let listener = TcpListener::bind((bind_address, port))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(
            "Relay listening on {} (tick {:?})",
            local_addr, config.tick_interval
        );

        let registry = Arc::new(RwLock::new(ConnectionRegistry::new()));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            shutdown.clone(),
            tasks.clone(),
            config.clone(),
        ));
        tasks.spawn(broadcast_loop(
            Arc::clone(&registry),
            shutdown.clone(),
            config,
        ));

        Ok(RelayServer {
            local_addr,
            registry,
            shutdown,
            tasks,
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.ensure_running()?;
        Ok(self.local_addr)
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> Result<usize, RelayError> {
        self.ensure_running()?;
        Ok(self.registry.read().await.len())
    }

    /// The states the next broadcast would carry
    pub async fn snapshot(&self) -> Result<Vec<StateMessage>, RelayError> {
        self.ensure_running()?;
        Ok(self.registry.read().await.snapshot())
    }

    /// Stops both loops, closes the listener and every live connection, and
    /// waits for all spawned tasks to finish
    ///
    /// Calling it again, or concurrently, is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping relay on {}", self.local_addr);

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        // Connections accepted concurrently with the cancel may still be here.
        let leftover = self.registry.write().await.drain();
        for record in leftover {
            close_record(record).await;
        }
        info!("Relay on {} stopped", self.local_addr);
    }

    fn ensure_running(&self) -> Result<(), RelayError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RelayError::NotRunning)
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accepts connections until shutdown, spawning one reader task per peer
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<RwLock<ConnectionRegistry>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    config: ServerConfig,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                let (read_half, write_half) = stream.into_split();
                let writer: ConnWriter = Arc::new(Mutex::new(Box::new(write_half)));
                let cancel = shutdown.child_token();

                let conn_id = registry
                    .write()
                    .await
                    .register(addr, writer, cancel.clone());
                info!("Connection {} accepted from {}", conn_id, addr);

                tasks.spawn(reader_task(
                    conn_id,
                    addr,
                    read_half,
                    Arc::clone(&registry),
                    cancel,
                    config.clone(),
                ));
            }
            Err(e) => {
                if shutdown.is_cancelled() {
                    break;
                }
                warn!("Error accepting connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop exited");
}

/// Stores every state received on one connection until it ends
///
/// This task is the normal removal path: when the stream closes, errors or is
/// cancelled, the record leaves the registry and the socket is shut down.
async fn reader_task(
    conn_id: ConnId,
    addr: SocketAddr,
    read_half: OwnedReadHalf,
    registry: Arc<RwLock<ConnectionRegistry>>,
    cancel: CancellationToken,
    config: ServerConfig,
) {
    let mut reader = ConnectionReader::new(read_half, config.read_timeout, config.max_line_len);

    let reason = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break "closed by server".to_string(),
            event = reader.next_event() => event,
        };

        match event {
            Ok(ReadEvent::Messages(messages)) => {
                let states: Vec<StateMessage> = messages
                    .into_iter()
                    .filter_map(|message| match message {
                        WireMessage::State(state) => Some(state),
                        WireMessage::Batch(_) => {
                            debug!("Ignoring batch sent by connection {}", conn_id);
                            None
                        }
                    })
                    .collect();

                if !states.is_empty() {
                    let mut registry = registry.write().await;
                    for state in states {
                        registry.record_state(conn_id, state);
                    }
                }
            }
            Ok(ReadEvent::Idle) => continue,
            Ok(ReadEvent::Closed) => break "peer closed the connection".to_string(),
            Err(e) => break format!("read error: {}", e),
        }
    };

    let record = registry.write().await.remove(conn_id);
    match record {
        Some(record) => {
            info!(
                "Connection {} from {} closed after {:?}: {}",
                conn_id,
                addr,
                record.connected_at.elapsed(),
                reason
            );
            close_record(record).await;
        }
        None => info!("Connection {} from {} closed: {}", conn_id, addr, reason),
    }
}

/// Runs [`broadcast_once`] every tick until shutdown
async fn broadcast_loop(
    registry: Arc<RwLock<ConnectionRegistry>>,
    shutdown: CancellationToken,
    config: ServerConfig,
) {
    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        broadcast_once(&registry, config.write_timeout).await;
    }

    debug!("Broadcast loop exited");
}

/// Writes one batch of the latest known states to every live connection
///
/// The registry is only borrowed to copy out the snapshot and the writers;
/// all writes run concurrently outside the lock. A connection whose write
/// fails or exceeds `write_timeout` is removed and closed without affecting
/// delivery to the others. Returns the number of connections written to.
pub async fn broadcast_once(
    registry: &RwLock<ConnectionRegistry>,
    write_timeout: Duration,
) -> usize {
    let (states, targets) = {
        let registry = registry.read().await;
        (registry.snapshot(), registry.targets())
    };

    if states.is_empty() || targets.is_empty() {
        return 0;
    }

    let line = match encode(&WireMessage::Batch(BatchMessage { messages: states })) {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to encode batch: {}", e);
            return 0;
        }
    };

    let mut writes = JoinSet::new();
    for target in targets {
        let line = line.clone();
        writes.spawn(async move {
            let result = write_line(&target.writer, &line, write_timeout).await;
            (target.id, target.addr, result)
        });
    }

    let mut delivered = 0;
    let mut failed = Vec::new();
    while let Some(joined) = writes.join_next().await {
        match joined {
            Ok((_, _, Ok(()))) => delivered += 1,
            Ok((conn_id, addr, Err(e))) => {
                warn!("Dropping connection {} ({}): {}", conn_id, addr, e);
                failed.push(conn_id);
            }
            Err(e) => error!("Broadcast write task failed: {}", e),
        }
    }

    if !failed.is_empty() {
        let removed: Vec<ConnectionRecord> = {
            let mut registry = registry.write().await;
            failed
                .into_iter()
                .filter_map(|conn_id| registry.remove(conn_id))
                .collect()
        };
        for record in removed {
            close_record(record).await;
        }
    }

    delivered
}

async fn write_line(writer: &ConnWriter, line: &Bytes, write_timeout: Duration) -> io::Result<()> {
    let write = async {
        let mut writer = writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await
    };

    match timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

/// Stops a connection's reader and shuts down its write half
async fn close_record(record: ConnectionRecord) {
    record.cancel_token().cancel();

    let shutdown = async {
        let mut writer = record.writer().lock().await;
        writer.shutdown().await
    };
    match timeout(DEFAULT_WRITE_TIMEOUT, shutdown).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error shutting down connection {}: {}", record.id, e),
        Err(_) => debug!("Timed out shutting down connection {}", record.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode, framing::LineFramer};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_test::io::Builder;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn register_duplex(registry: &mut ConnectionRegistry, port: u16) -> (ConnId, DuplexStream) {
        let (ours, theirs) = duplex(4096);
        let writer: ConnWriter = Arc::new(Mutex::new(Box::new(ours)));
        let id = registry.register(test_addr(port), writer, CancellationToken::new());
        (id, theirs)
    }

    async fn read_batch(stream: &mut DuplexStream) -> BatchMessage {
        let mut framer = LineFramer::new(MAX_LINE_LEN);
        loop {
            framer.buf_mut().reserve(1024);
            let n = stream.read_buf(framer.buf_mut()).await.unwrap();
            assert!(n > 0, "stream closed before a batch arrived");
            if let Some(line) = framer.drain_lines().unwrap().into_iter().next() {
                match decode(&line).unwrap() {
                    WireMessage::Batch(batch) => return batch,
                    other => panic!("Expected batch, got {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.max_line_len, MAX_LINE_LEN);
        assert!(config.write_timeout < config.read_timeout);
    }

    #[tokio::test]
    async fn test_broadcast_skipped_without_states() {
        let mut inner = ConnectionRegistry::new();
        let (_, _peer) = register_duplex(&mut inner, 9001);
        let registry = RwLock::new(inner);

        assert_eq!(broadcast_once(&registry, Duration::from_millis(100)).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let mut inner = ConnectionRegistry::new();
        let (a, mut peer_a) = register_duplex(&mut inner, 9001);
        let (_, mut peer_b) = register_duplex(&mut inner, 9002);
        inner.record_state(a, StateMessage::new("p1", 10.0, 20.0, 0.0));
        let registry = RwLock::new(inner);

        assert_eq!(broadcast_once(&registry, Duration::from_millis(100)).await, 2);

        for peer in [&mut peer_a, &mut peer_b] {
            let batch = read_batch(peer).await;
            assert_eq!(batch.messages, vec![StateMessage::new("p1", 10.0, 20.0, 0.0)]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_carries_latest_state_only() {
        let mut inner = ConnectionRegistry::new();
        let (a, mut peer_a) = register_duplex(&mut inner, 9001);
        inner.record_state(a, StateMessage::new("p1", 1.0, 1.0, 0.0));
        inner.record_state(a, StateMessage::new("p1", 2.0, 2.0, 0.0));
        let registry = RwLock::new(inner);

        broadcast_once(&registry, Duration::from_millis(100)).await;

        let batch = read_batch(&mut peer_a).await;
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].x, 2.0);
    }

    #[tokio::test]
    async fn test_failed_write_drops_only_that_connection() {
        let mut inner = ConnectionRegistry::new();
        let (a, mut peer_a) = register_duplex(&mut inner, 9001);
        let (c, mut peer_c) = register_duplex(&mut inner, 9003);

        let broken = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let broken_writer: ConnWriter = Arc::new(Mutex::new(Box::new(broken)));
        let broken_cancel = CancellationToken::new();
        let b = inner.register(test_addr(9002), broken_writer, broken_cancel.clone());

        inner.record_state(a, StateMessage::new("p1", 1.0, 0.0, 0.0));
        inner.record_state(c, StateMessage::new("p3", 3.0, 0.0, 0.0));
        let registry = RwLock::new(inner);

        assert_eq!(broadcast_once(&registry, Duration::from_millis(100)).await, 2);

        let registry = registry.into_inner();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(b).is_none());
        assert!(broken_cancel.is_cancelled());

        assert_eq!(read_batch(&mut peer_a).await.messages.len(), 2);
        assert_eq!(read_batch(&mut peer_c).await.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let mut inner = ConnectionRegistry::new();
        // A duplex with a tiny buffer that nobody reads stalls after 8 bytes.
        let (ours, _theirs) = duplex(8);
        let writer: ConnWriter = Arc::new(Mutex::new(Box::new(ours)));
        let stalled = inner.register(test_addr(9001), writer, CancellationToken::new());
        inner.record_state(stalled, StateMessage::new("p1", 1.0, 0.0, 0.0));
        let registry = RwLock::new(inner);

        assert_eq!(broadcast_once(&registry, Duration::from_millis(50)).await, 0);
        assert!(registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_reports_bind_error() {
        let server = RelayServer::start("127.0.0.1", 0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let result = RelayServer::start("127.0.0.1", port).await;
        assert!(matches!(result, Err(RelayError::Bind { .. })));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_server_is_not_running() {
        let server = RelayServer::start("127.0.0.1", 0).await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.connection_count().await.unwrap(), 0);

        server.stop().await;
        server.stop().await;

        assert!(!server.is_running());
        assert!(matches!(server.local_addr(), Err(RelayError::NotRunning)));
        assert!(matches!(
            server.connection_count().await,
            Err(RelayError::NotRunning)
        ));
        assert!(matches!(server.snapshot().await, Err(RelayError::NotRunning)));
    }
}
