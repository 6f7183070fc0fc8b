//! The hub owns the registry of live connections.
//!
//! Every membership change and every broadcast goes through one bounded
//! event channel and is handled by a single task, so fan-out never observes
//! the registry mid-mutation. A broadcast's fan-out completes (or is given up
//! per peer) before the next event is taken.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use futures::{StreamExt, future::join_all, stream};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, HubConfig},
    connection::{Connection, ConnectionId, DisconnectReason, IdAllocator},
    error::RelayError,
    frame::Frame,
};

enum HubEvent {
    Join(Arc<Connection>),
    Leave {
        conn: Arc<Connection>,
        reason: DisconnectReason,
    },
    Broadcast {
        sender: ConnectionId,
        payload: Vec<u8>,
    },
    Members(oneshot::Sender<Vec<ConnectionId>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct Hub {
    registry: HashMap<ConnectionId, Arc<Connection>>,
    events: mpsc::Receiver<HubEvent>,
    config: Arc<HubConfig>,
}

/// Cloneable entry point for submitting events to a [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    ids: Arc<IdAllocator>,
    config: Arc<HubConfig>,
}

impl Hub {
    /// Fails if `config` does not validate; keepalive timers cannot run on a
    /// zero or inverted ping period.
    pub fn new(config: HubConfig) -> Result<(Hub, HubHandle), ConfigError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let config = Arc::new(config);
        let hub = Hub {
            registry: HashMap::new(),
            events: events_rx,
            config: Arc::clone(&config),
        };
        let handle = HubHandle {
            events: events_tx,
            ids: Arc::new(IdAllocator::new()),
            config,
        };
        Ok((hub, handle))
    }

    /// Creates a hub and runs its event loop on a background task.
    pub fn spawn(config: HubConfig) -> Result<(HubHandle, JoinHandle<()>), ConfigError> {
        let (hub, handle) = Hub::new(config)?;
        let task = tokio::spawn(hub.run());
        Ok((handle, task))
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                HubEvent::Join(conn) => self.join(conn),
                HubEvent::Leave { conn, reason } => self.leave(conn, reason),
                HubEvent::Broadcast { sender, payload } => self.publish(sender, payload).await,
                HubEvent::Members(reply) => {
                    let _ = reply.send(self.members());
                }
                HubEvent::Shutdown(reply) => {
                    self.close_all().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("hub event loop stopped");
    }

    fn join(&mut self, conn: Arc<Connection>) {
        let id = conn.id();
        if conn.is_retired() || conn.is_closed() {
            debug!(conn = %id, "ignoring join for a torn down connection");
            return;
        }
        match self.registry.entry(id) {
            Entry::Occupied(_) => debug!(conn = %id, "ignoring duplicate join"),
            Entry::Vacant(slot) => {
                slot.insert(conn);
                info!(conn = %id, peers = self.registry.len(), "client connected");
            }
        }
    }

    fn leave(&mut self, conn: Arc<Connection>, reason: DisconnectReason) {
        let id = conn.id();
        conn.retire();
        if self.registry.remove(&id).is_some() {
            info!(conn = %id, %reason, peers = self.registry.len(), "client disconnected");
        } else {
            debug!(conn = %id, %reason, "leave for unregistered connection");
        }

        // The registry entry is gone already; the close itself must not hold
        // up the loop if the peer is wedged.
        let write_wait = self.config.write_wait;
        tokio::spawn(async move {
            conn.close(reason.close_code(), reason.as_str(), write_wait)
                .await;
        });
    }

    async fn publish(&self, sender: ConnectionId, payload: Vec<u8>) {
        if !self.registry.contains_key(&sender) {
            debug!(conn = %sender, "dropping broadcast from unregistered sender");
            return;
        }

        let peers: Vec<Arc<Connection>> = self
            .registry
            .values()
            .filter(|conn| conn.id() != sender)
            .cloned()
            .collect();
        debug!(conn = %sender, bytes = payload.len(), peers = peers.len(), "broadcasting");

        let frame = Frame::outbound(payload);
        let send_timeout = self.config.send_timeout;
        let write_wait = self.config.write_wait;

        stream::iter(peers)
            .for_each_concurrent(self.config.fanout_concurrency, |peer| {
                let frame = frame.clone();
                async move {
                    let err = match timeout(send_timeout, peer.send(frame)).await {
                        Ok(Ok(())) => return,
                        Ok(Err(err)) => err,
                        Err(_) => RelayError::WriteTimeout(send_timeout),
                    };
                    warn!(conn = %peer.id(), error = %err, "failed to deliver message");
                    tokio::spawn(async move {
                        peer.report_error(&err, write_wait).await;
                    });
                }
            })
            .await;
    }

    fn members(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.registry.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn close_all(&mut self) {
        let reason = DisconnectReason::Shutdown;
        let write_wait = self.config.write_wait;
        info!(peers = self.registry.len(), "closing all connections");

        let closing = self.registry.drain().map(|(_, conn)| async move {
            conn.retire();
            conn.close(reason.close_code(), reason.as_str(), write_wait)
                .await;
        });
        join_all(closing).await;
    }
}

impl HubHandle {
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Assigns an identity for a newly accepted connection.
    pub fn next_id(&self) -> ConnectionId {
        self.ids.next_id()
    }

    /// Registers `conn`. Joining an identity that is already registered is a
    /// no-op.
    pub async fn join(&self, conn: Arc<Connection>) -> Result<(), RelayError> {
        self.submit(HubEvent::Join(conn)).await
    }

    /// Removes `conn` and closes its stream. Leaving twice is a no-op.
    pub async fn leave(
        &self,
        conn: Arc<Connection>,
        reason: DisconnectReason,
    ) -> Result<(), RelayError> {
        self.submit(HubEvent::Leave { conn, reason }).await
    }

    /// Queues `payload` for every registered connection except `sender`.
    /// Waits while the event channel is full.
    pub async fn broadcast(&self, sender: ConnectionId, payload: Vec<u8>) -> Result<(), RelayError> {
        self.submit(HubEvent::Broadcast { sender, payload }).await
    }

    /// Single teardown path for a dead connection. Only the first caller per
    /// connection raises the liveness signal and queues a leave.
    pub async fn disconnect(&self, conn: &Arc<Connection>, reason: DisconnectReason) {
        if !conn.retire() {
            return;
        }
        debug!(conn = %conn.id(), %reason, "connection retired");
        if self.leave(Arc::clone(conn), reason).await.is_err() {
            conn.close(reason.close_code(), reason.as_str(), self.config.write_wait)
                .await;
        }
    }

    /// Identities currently eligible for broadcasts, sorted.
    pub async fn members(&self) -> Result<Vec<ConnectionId>, RelayError> {
        let (reply, response) = oneshot::channel();
        self.submit(HubEvent::Members(reply)).await?;
        response.await.map_err(|_| RelayError::HubClosed)
    }

    /// Closes every registered connection and stops the event loop.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (reply, response) = oneshot::channel();
        self.submit(HubEvent::Shutdown(reply)).await?;
        response.await.map_err(|_| RelayError::HubClosed)
    }

    async fn submit(&self, event: HubEvent) -> Result<(), RelayError> {
        self.events
            .send(event)
            .await
            .map_err(|_| RelayError::HubClosed)
    }
}
