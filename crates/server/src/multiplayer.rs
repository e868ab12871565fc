//! Multiplayer host: QUIC transport and relay bridge around a
//! [`ReplicationServer`].

use crate::server::ReplicationServer;
use crate::settings::ServerSettings;
use anyhow::{Context, Result};
use hullsync_core::ConnectionId;
use hullsync_net::{
    pump_outbound, ChannelManager, EndpointKey, RelayFrame, RelaySink, RemoteEndpoint,
    ServerEndpoint,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Server context shared between the host loop and connection tasks.
pub type SharedServer = Arc<Mutex<ReplicationServer>>;

const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Host side of the peer-to-peer relay bridge.
#[derive(Debug)]
pub struct RelayBridge {
    inbound: mpsc::UnboundedReceiver<RelayFrame>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
}

/// Relay side of the bridge: frames from peers go into `to_server`,
/// frames for peers come out of `from_server`.
#[derive(Debug)]
pub struct RelayPort {
    /// Frames received from peers.
    pub to_server: mpsc::UnboundedSender<RelayFrame>,
    /// Frames addressed to peers.
    pub from_server: mpsc::UnboundedReceiver<RelayFrame>,
}

/// Create a connected bridge/port pair.
pub fn relay_bridge() -> (RelayBridge, RelayPort) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::unbounded_channel();
    (
        RelayBridge { inbound, outbound },
        RelayPort {
            to_server,
            from_server,
        },
    )
}

/// Multiplayer host driving replication, voice and timeouts.
pub struct MultiplayerHost {
    server: SharedServer,
    endpoint: ServerEndpoint,
    relay: Option<RelayBridge>,
}

impl MultiplayerHost {
    /// Validate `settings` and bind the QUIC endpoint.
    pub fn bind(settings: ServerSettings) -> Result<Self> {
        settings.validate().context("Invalid server settings")?;
        let endpoint = ServerEndpoint::bind(settings.bind_addr, settings.link_timings())
            .context("Failed to bind server endpoint")?;
        info!(addr = %endpoint.local_addr(), name = %settings.server_name, "Multiplayer host bound");

        Ok(Self {
            server: Arc::new(Mutex::new(ReplicationServer::new(settings))),
            endpoint,
            relay: None,
        })
    }

    /// Also accept peers through a relay bridge.
    pub fn with_relay(mut self, bridge: RelayBridge) -> Self {
        self.relay = Some(bridge);
        self
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Handle to the server context.
    pub fn server(&self) -> SharedServer {
        Arc::clone(&self.server)
    }

    /// Run until `shutdown` resolves or the endpoint closes, then disconnect
    /// everyone with `ServerShutdown`.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let settings = self.server.lock().await.settings().clone();
        let mut tick = tokio::time::interval(settings.tick_interval());
        let mut voice = tokio::time::interval(settings.voice_interval());
        let mut timeouts = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);
        for interval in [&mut tick, &mut voice, &mut timeouts] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();
        info!(tick_rate = settings.tick_rate, relay = self.relay.is_some(), "Host loop started");

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        warn!("Endpoint closed");
                        break;
                    };
                    tasks.spawn(serve_connection(Arc::clone(&self.server), incoming));
                }
                _ = tick.tick() => {
                    self.server.lock().await.replication_tick();
                }
                _ = voice.tick() => {
                    self.server.lock().await.flush_voice(Instant::now());
                }
                _ = timeouts.tick() => {
                    self.server.lock().await.check_timeouts(Instant::now());
                }
                frame = next_relay_frame(&mut self.relay) => match frame {
                    Some(frame) => {
                        if let Some(bridge) = &self.relay {
                            route_relay_frame(&self.server, &bridge.outbound, frame).await;
                        }
                    }
                    None => {
                        warn!("Relay bridge closed");
                        self.relay = None;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(Err(err)) => debug!("Connection task failed: {:#}", err),
                        Err(err) => warn!("Connection task panicked: {}", err),
                        Ok(Ok(())) => {}
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.server.lock().await.shutdown();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!(remaining = tasks.len(), "Aborting connection tasks");
            tasks.shutdown().await;
        }
        self.endpoint.close();
        info!("Host stopped");
        Ok(())
    }
}

async fn next_relay_frame(relay: &mut Option<RelayBridge>) -> Option<RelayFrame> {
    match relay {
        Some(bridge) => bridge.inbound.recv().await,
        None => std::future::pending().await,
    }
}

/// Feed one relay frame into the server, admitting the peer on first contact.
async fn route_relay_frame(server: &SharedServer, outbound: &mpsc::UnboundedSender<RelayFrame>, frame: RelayFrame) {
    let now = Instant::now();
    let mut server = server.lock().await;

    let id = match server.connection_for(&EndpointKey::Peer(frame.peer)) {
        Some(id) => id,
        None => match server.connect(RemoteEndpoint::PeerRelay(frame.peer), now) {
            Ok(admission) => {
                tokio::spawn(pump_outbound(
                    admission.outbound,
                    RelaySink::new(frame.peer, outbound.clone()),
                ));
                if !admission.accepted {
                    return;
                }
                admission.id
            }
            Err(err) => {
                debug!(peer = %frame.peer, error = %err, "Relay frame dropped");
                return;
            }
        },
    };

    if let Err(err) = server.handle_packet(id, &frame.bytes, now) {
        debug!(conn = %id, error = %err, "Relay packet rejected");
    }
}

/// Accept one QUIC connection and shuttle packets until either side closes.
#[instrument(skip_all, fields(addr = %incoming.remote_address()))]
async fn serve_connection(server: SharedServer, incoming: quinn::Incoming) -> Result<()> {
    let connection = incoming.await.context("QUIC handshake failed")?;
    let endpoint = RemoteEndpoint::Socket(connection.remote_address());

    let admission = server.lock().await.connect(endpoint, Instant::now());
    let admission = match admission {
        Ok(admission) => admission,
        Err(err) => {
            connection.close(0u32.into(), b"banned");
            return Err(err).context("Connection refused");
        }
    };

    let channels = ChannelManager::new(connection);
    let pump = tokio::spawn(pump_outbound(admission.outbound, channels.clone()));
    if !admission.accepted {
        let _ = pump.await;
        return Ok(());
    }

    let id = admission.id;
    debug!(conn = %id, "Connection established");
    let mut reliable = tokio::spawn(receive_loop(Arc::clone(&server), id, channels.clone(), true));
    let mut unreliable = tokio::spawn(receive_loop(Arc::clone(&server), id, channels, false));
    tokio::select! {
        _ = &mut reliable => unreliable.abort(),
        _ = &mut unreliable => reliable.abort(),
    }

    server.lock().await.connection_lost(id);
    let _ = pump.await;
    debug!(conn = %id, "Connection finished");
    Ok(())
}

async fn receive_loop(server: SharedServer, id: ConnectionId, channels: ChannelManager, reliable: bool) {
    loop {
        let received = if reliable {
            channels.recv_reliable().await
        } else {
            channels.recv_unreliable().await
        };
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(conn = %id, reliable, "Receive loop ended: {:#}", err);
                return;
            }
        };

        let mut guard = server.lock().await;
        if let Err(err) = guard.handle_packet(id, &bytes, Instant::now()) {
            debug!(conn = %id, error = %err, "Packet rejected");
        }
        if guard.client(id).is_none() {
            return;
        }
    }
}
