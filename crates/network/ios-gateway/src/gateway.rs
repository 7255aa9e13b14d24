//! The TCP device gateway.
//!
//! One accept loop and one read loop per connected device, all tracked so
//! that [`DeviceGateway::stop`] returns only after every one of them has
//! finished. The client registry is a concurrent map shared by the accept
//! loop, the read loops and the send paths; a read loop removes its own entry
//! and closes the socket as soon as it exits.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::events::{ClientInfo, DeviceFrame, GatewayEvent, GatewayStatus};
use crate::framing::FrameDecoder;
use crate::stats::{GatewayStats, GatewayStatsSnapshot};
use chrono::Utc;
use dashmap::DashMap;
use ios_core::Validatable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct ClientHandle {
    info: ClientInfo,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

struct Listening {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

struct Shared {
    config: GatewayConfig,
    clients: DashMap<Uuid, ClientHandle>,
    events: broadcast::Sender<GatewayEvent>,
    stats: GatewayStats,
    running: AtomicBool,
}

impl Shared {
    fn emit(&self, event: GatewayEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn close_client(&self, id: Uuid) -> Option<ClientInfo> {
        let (_, handle) = self.clients.remove(&id)?;
        handle.cancel.cancel();
        if let Err(e) = handle.writer.lock().await.shutdown().await {
            debug!(connection_id = %id, error = %e, "Socket shutdown failed");
        }
        Some(handle.info)
    }
}

/// Accepts device connections and bridges their frames to subscribers.
///
/// Cloning is cheap; clones share the same listener and registry.
#[derive(Clone)]
pub struct DeviceGateway {
    shared: Arc<Shared>,
    listening: Arc<Mutex<Option<Listening>>>,
}

impl DeviceGateway {
    /// Create a stopped gateway
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                clients: DashMap::new(),
                events,
                stats: GatewayStats::default(),
                running: AtomicBool::new(false),
            }),
            listening: Arc::new(Mutex::new(None)),
        }
    }

    /// Gateway configuration
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// Receive gateway notifications from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    /// Whether the listener is accepting connections
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of registered, not yet closed connections
    #[must_use]
    pub fn connected_client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Registered connections
    #[must_use]
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared
            .clients
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> GatewayStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Address the listener is bound to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Bind and start accepting connections.
    ///
    /// Calling this while already running returns the existing address.
    /// Bind failures are retried when auto-restart is enabled.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut listening = self.listening.lock().await;
        if let Some(current) = listening.as_ref() {
            debug!(address = %current.local_addr, "Gateway already running");
            return Ok(current.local_addr);
        }

        let config = &self.shared.config;
        config
            .validate()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let address = config.socket_addr()?;
        info!(config = %config.summary(), framing = %config.framing, "Starting device gateway");

        let listener = match bind_with_retry(config, address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Device gateway failed to start");
                self.shared
                    .emit(GatewayEvent::StatusChanged(GatewayStatus::new(format!("Start failed: {e}"), false)));
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            cancel.clone(),
            tracker.clone(),
        ));

        *listening = Some(Listening {
            local_addr,
            cancel,
            tracker,
            accept,
        });
        self.shared.running.store(true, Ordering::SeqCst);

        info!(address = %local_addr, "Device gateway listening");
        self.shared
            .emit(GatewayEvent::StatusChanged(GatewayStatus::new("Server started", true)));
        Ok(local_addr)
    }

    /// Stop accepting, close every connection, and wait for all loops to end.
    ///
    /// Returns false if the gateway was not running.
    pub async fn stop(&self) -> bool {
        let Some(listening) = self.listening.lock().await.take() else {
            debug!("Gateway not running");
            return false;
        };

        info!(clients = self.connected_client_count(), "Stopping device gateway");
        self.shared.running.store(false, Ordering::SeqCst);
        listening.cancel.cancel();

        let ids: Vec<Uuid> = self.shared.clients.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(info) = self.shared.close_client(id).await {
                self.shared.emit(GatewayEvent::ClientDisconnected(info));
            }
        }

        if let Err(e) = listening.accept.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        listening.tracker.close();
        listening.tracker.wait().await;

        info!("Device gateway stopped");
        self.shared
            .emit(GatewayEvent::StatusChanged(GatewayStatus::new("Server stopped", false)));
        true
    }

    /// Close one connection; false if it is not registered
    pub async fn disconnect_client(&self, id: Uuid) -> bool {
        match self.shared.close_client(id).await {
            Some(info) => {
                info!(connection_id = %id, endpoint = %info.endpoint, "Client disconnected by gateway");
                self.shared.emit(GatewayEvent::ClientDisconnected(info));
                true
            }
            None => false,
        }
    }

    /// Write `data` to one connection.
    ///
    /// Returns false, after logging, if the connection is unknown or the write
    /// fails or times out.
    pub async fn send_to(&self, id: Uuid, data: &str) -> bool {
        let Some(writer) = self.shared.clients.get(&id).map(|c| Arc::clone(&c.writer)) else {
            warn!(connection_id = %id, "Send to unknown client");
            return false;
        };

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(data.as_bytes()).await?;
            writer.flush().await
        };

        match tokio::time::timeout(self.shared.config.send_timeout(), write).await {
            Ok(Ok(())) => {
                self.shared.stats.record_send();
                debug!(connection_id = %id, bytes = data.len(), "Sent to client");
                true
            }
            Ok(Err(e)) => {
                self.shared.stats.record_send_failure();
                warn!(connection_id = %id, error = %e, "Send to client failed");
                false
            }
            Err(_) => {
                self.shared.stats.record_send_failure();
                warn!(connection_id = %id, timeout = ?self.shared.config.send_timeout(), "Send to client timed out");
                false
            }
        }
    }

    /// Write `data` to every connection concurrently; returns the success count
    pub async fn broadcast(&self, data: &str) -> usize {
        let ids: Vec<Uuid> = self.shared.clients.iter().map(|entry| *entry.key()).collect();
        let total = ids.len();
        let results = futures::future::join_all(ids.into_iter().map(|id| self.send_to(id, data))).await;
        let sent = results.into_iter().filter(|ok| *ok).count();
        debug!(total, sent, "Broadcast complete");
        sent
    }
}

impl std::fmt::Debug for DeviceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGateway")
            .field("config", &self.shared.config.summary())
            .field("running", &self.is_running())
            .field("clients", &self.connected_client_count())
            .finish()
    }
}

async fn bind_with_retry(config: &GatewayConfig, address: SocketAddr) -> Result<TcpListener> {
    let attempts = if config.enable_auto_restart {
        config.max_retries.saturating_add(1)
    } else {
        1
    };

    let mut attempt = 1;
    loop {
        match TcpListener::bind(address).await {
            Ok(listener) => return Ok(listener),
            Err(source) if attempt >= attempts => {
                return Err(GatewayError::Bind {
                    address: address.to_string(),
                    source,
                })
            }
            Err(e) => {
                warn!(
                    address = %address,
                    attempt,
                    error = %e,
                    retry_in = ?config.restart_interval(),
                    "Bind failed, retrying"
                );
                tokio::time::sleep(config.restart_interval()).await;
                attempt += 1;
            }
        }
    }
}

fn configure_socket(stream: &TcpStream, config: &GatewayConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    if config.enable_keep_alive {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(config.keep_alive_interval())
            .with_interval(config.keep_alive_interval());
        if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!(error = %e, "Failed to set TCP keep-alive");
        }
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    info!("Accept loop started");

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if shared.clients.len() >= shared.config.max_connections {
                    shared.stats.record_rejected();
                    warn!(
                        endpoint = %peer,
                        limit = shared.config.max_connections,
                        "Connection limit reached, refusing client"
                    );
                    drop(stream);
                    continue;
                }

                configure_socket(&stream, &shared.config);
                let info = ClientInfo {
                    id: Uuid::new_v4(),
                    endpoint: peer.to_string(),
                    connected_at: Utc::now(),
                };
                let (reader, writer) = stream.into_split();
                let connection_cancel = cancel.child_token();

                shared.clients.insert(
                    info.id,
                    ClientHandle {
                        info: info.clone(),
                        writer: Arc::new(Mutex::new(writer)),
                        cancel: connection_cancel.clone(),
                    },
                );
                shared.stats.record_accepted();
                info!(connection_id = %info.id, endpoint = %info.endpoint, "Client connected");
                shared.emit(GatewayEvent::ClientConnected(info.clone()));

                tracker.spawn(read_loop(Arc::clone(&shared), info, reader, connection_cancel));
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(shared.config.accept_retry_delay()) => {}
                }
            }
        }
    }

    info!("Accept loop stopped");
}

async fn read_loop(
    shared: Arc<Shared>,
    info: ClientInfo,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; shared.config.buffer_size.max(1)];
    let mut decoder = FrameDecoder::new(shared.config.framing, shared.config.max_frame_len);
    let mut peer_closed = false;

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                info!(connection_id = %info.id, "Client closed the connection");
                peer_closed = true;
                break;
            }
            Ok(n) => {
                shared.stats.record_bytes(n);
                for frame in decoder.push(&buffer[..n]) {
                    publish_frame(&shared, &info, frame);
                }
            }
            Err(e) => {
                warn!(connection_id = %info.id, error = %e, "Read failed");
                break;
            }
        }
    }

    if peer_closed {
        if let Some(frame) = decoder.finish() {
            publish_frame(&shared, &info, frame);
        }
    }

    // stop() or disconnect_client() may already have removed the entry
    if shared.close_client(info.id).await.is_some() {
        shared.emit(GatewayEvent::ClientDisconnected(info.clone()));
    }
    debug!(connection_id = %info.id, "Read loop finished");
}

fn publish_frame(shared: &Shared, info: &ClientInfo, data: String) {
    shared.stats.record_frame();
    debug!(connection_id = %info.id, data = %data, "Frame received");
    shared.emit(GatewayEvent::DataReceived(DeviceFrame {
        client_id: info.id,
        endpoint: info.endpoint.clone(),
        data,
        received_at: Utc::now(),
    }));
}
