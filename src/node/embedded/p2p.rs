//! TCP peer listener
//!
//! Accepts inbound peers, dials configured seed peers and exchanges chain
//! heights as newline-terminated `height <n>` messages.

use super::{PeerServer, ProtocolHandler};
use crate::node::ConnectionInfo;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

struct Peer {
    address: SocketAddr,
    is_incoming: bool,
    outbox: mpsc::UnboundedSender<String>,
}

struct Shared {
    bind: SocketAddr,
    seed_peers: Vec<SocketAddr>,
    protocol: Arc<dyn ProtocolHandler>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: DashMap<Uuid, Peer>,
    white_peers: DashMap<SocketAddr, ()>,
    grey_peers: DashMap<SocketAddr, ()>,
    stop: CancellationToken,
}

/// Peer server over plain TCP
#[derive(Clone)]
pub struct TcpPeerServer {
    shared: Arc<Shared>,
}

fn height_message(height: u64) -> String {
    format!("height {}\n", height)
}

fn parse_height(line: &str) -> Option<u64> {
    line.trim().strip_prefix("height ")?.parse().ok()
}

impl TcpPeerServer {
    pub fn new(
        bind: SocketAddr,
        seed_peers: Vec<SocketAddr>,
        protocol: Arc<dyn ProtocolHandler>,
    ) -> Self {
        let grey_peers = DashMap::new();
        for peer in &seed_peers {
            grey_peers.insert(*peer, ());
        }

        Self {
            shared: Arc::new(Shared {
                bind,
                seed_peers,
                protocol,
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                connections: DashMap::new(),
                white_peers: DashMap::new(),
                grey_peers,
                stop: CancellationToken::new(),
            }),
        }
    }

    fn spawn_connection(&self, stream: TcpStream, address: SocketAddr, is_incoming: bool) {
        let shared = self.shared.clone();
        let id = Uuid::new_v4();
        let span = info_span!("peer", %id, %address, is_incoming);
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(&shared, id, stream, address, is_incoming).await {
                    debug!("Peer connection ended with error: {}", e);
                }
                shared.connections.remove(&id);
                shared.protocol.on_peer_count_changed(shared.connections.len());
                debug!("Peer disconnected");
            }
            .instrument(span),
        );
    }

    async fn dial_seeds(&self) {
        let dials = self
            .shared
            .seed_peers
            .iter()
            .map(|&peer| async move { (peer, TcpStream::connect(peer).await) });

        for (peer, dialed) in join_all(dials).await {
            match dialed {
                Ok(stream) => {
                    self.shared.grey_peers.remove(&peer);
                    self.shared.white_peers.insert(peer, ());
                    self.spawn_connection(stream, peer, false);
                }
                Err(e) => warn!("Failed to connect to seed peer {}: {}", peer, e),
            }
        }
    }
}

async fn handle_connection(
    shared: &Shared,
    id: Uuid,
    stream: TcpStream,
    address: SocketAddr,
    is_incoming: bool,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (outbox, mut inbox) = mpsc::unbounded_channel();

    shared.connections.insert(
        id,
        Peer {
            address,
            is_incoming,
            outbox,
        },
    );
    shared.protocol.on_peer_count_changed(shared.connections.len());
    debug!("Peer connected");

    writer
        .write_all(height_message(shared.protocol.local_height()).as_bytes())
        .await?;

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => match parse_height(&line) {
                    Some(height) => shared.protocol.on_peer_height(height),
                    None => debug!("Ignoring peer message: {}", line),
                },
                None => break,
            },
            message = inbox.recv() => match message {
                Some(message) => writer.write_all(message.as_bytes()).await?,
                None => break,
            },
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[async_trait]
impl PeerServer for TcpPeerServer {
    async fn init(&self) -> Result<()> {
        let listener = TcpListener::bind(self.shared.bind).await?;
        let local = listener.local_addr()?;
        info!("Peer server listening on {}", local);
        *self.shared.local_addr.lock() = Some(local);
        *self.shared.listener.lock() = Some(listener);
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let listener = self
            .shared
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::not_initialized("peer server is not initialized"))?;

        self.dial_seeds().await;

        loop {
            tokio::select! {
                _ = self.shared.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => self.spawn_connection(stream, address, true),
                    Err(e) => warn!("Failed to accept peer: {}", e),
                },
            }
        }

        debug!("Peer server loop finished");
        Ok(())
    }

    fn send_stop_signal(&self) {
        self.shared.stop.cancel();
    }

    async fn deinit(&self) {
        self.shared.stop.cancel();
        self.shared.listener.lock().take();
        self.shared.connections.clear();
        *self.shared.local_addr.lock() = None;
        self.shared.protocol.on_peer_count_changed(0);
        debug!("Peer server deinitialized");
    }

    fn broadcast_height(&self, height: u64) {
        let message = height_message(height);
        for peer in self.shared.connections.iter() {
            let _ = peer.outbox.send(message.clone());
        }
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                id: entry.key().to_string(),
                address: entry.address.to_string(),
                is_incoming: entry.is_incoming,
            })
            .collect()
    }

    fn connections_count(&self) -> u64 {
        self.shared.connections.len() as u64
    }

    fn outgoing_connections_count(&self) -> u64 {
        self.shared
            .connections
            .iter()
            .filter(|entry| !entry.is_incoming)
            .count() as u64
    }

    fn white_peers_count(&self) -> u64 {
        self.shared.white_peers.len() as u64
    }

    fn grey_peers_count(&self) -> u64 {
        self.shared.grey_peers.len() as u64
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }
}
