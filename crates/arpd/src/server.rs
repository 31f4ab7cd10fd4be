//! Dispatcher task, periodic timers and the client handle
//!
//! All cache mutation is serialized through one mpsc queue drained by
//! [`ArpServer::run`]. Queries that need an answer carry a oneshot reply
//! channel. The aging ticker and the bulk snapshot rebuilder share a
//! [`TickGate`] so a rebuild never interleaves with aging or bulk reads.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-5: Denial of Service Protection - Bounded dispatcher queue
//! - AU-12: Audit Record Generation - Request outcomes logged
//! - SI-11: Error Handling - Typed errors returned to callers

use crate::capture::PacketIo;
use crate::config::ArpdConfig;
use crate::engine::{ArpEngine, EngineContext, NeighborUpdate};
use crate::error::{ArpdError, Result};
use crate::hardware::HardwarePlane;
use crate::persistence::NeighborStore;
use crate::topology::{
    NotificationSource, TopologyEvent, TopologyMirror, TopologySource, fetch_topology,
};
use crate::types::{ActionRequest, BulkPage, IfIndex, NeighborEvent, NeighborState};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Capacity of the neighbor event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Wait between attempts to take the gate for a rebuild
const REBUILD_RETRY_DELAY: Duration = Duration::from_millis(10);

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work item for the dispatcher
#[derive(Debug)]
pub enum ArpMessage {
    /// Evidence from a receive loop
    Update(NeighborUpdate),
    /// IPv4 address seen in a data frame
    ObserveIp { ip: Ipv4Addr, port: IfIndex },
    /// One aging step
    Tick,
    RebuildSnapshot { done: oneshot::Sender<()> },
    Topology(TopologyEvent),
    SetTimeout { secs: u32, reply: Reply<bool> },
    Resolve {
        ip: Ipv4Addr,
        if_index: IfIndex,
        reply: Reply<()>,
    },
    RibWithdraw { ip: Ipv4Addr, reply: Reply<()> },
    Action {
        request: ActionRequest,
        reply: Reply<usize>,
    },
    Get { ip: Ipv4Addr, reply: Reply<NeighborState> },
    GetBulk {
        from: usize,
        count: usize,
        reply: Reply<BulkPage>,
    },
}

/// Coordination between aging ticks, bulk reads and snapshot rebuilds
///
/// The high bit marks a rebuild in progress, the low bits count bulk reads
/// in flight. A rebuild only starts when no read is active.
#[derive(Debug, Clone, Default)]
pub struct TickGate(Arc<AtomicU32>);

const REBUILD_BIT: u32 = 1 << 31;

impl TickGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aging is suspended while a rebuild or a bulk read runs
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub fn try_begin_rebuild(&self) -> bool {
        self.0
            .compare_exchange(0, REBUILD_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_rebuild(&self) {
        self.0.fetch_and(!REBUILD_BIT, Ordering::AcqRel);
    }

    /// Registers a bulk read unless a rebuild is running
    pub fn try_begin_read(&self) -> Option<ReadGuard> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & REBUILD_BIT == 0).then_some(state + 1)
            })
            .ok()
            .map(|_| ReadGuard(self.0.clone()))
    }
}

/// Active bulk read, released on drop
#[derive(Debug)]
pub struct ReadGuard(Arc<AtomicU32>);

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns the engine and drains the dispatcher queue
pub struct ArpServer {
    engine: ArpEngine,
    rx: mpsc::Receiver<ArpMessage>,
}

impl ArpServer {
    pub fn new(engine: ArpEngine, rx: mpsc::Receiver<ArpMessage>) -> Self {
        Self { engine, rx }
    }

    /// Drains the queue; the engine holds a sender through its receive loops,
    /// so this only returns once the runtime shuts down
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("Dispatcher running");
        while let Some(message) = self.rx.recv().await {
            self.handle(message).await;
        }
        self.engine.receivers_mut().stop_all().await;
        info!("Dispatcher stopped");
    }

    async fn handle(&mut self, message: ArpMessage) {
        match message {
            ArpMessage::Update(update) => {
                if let Err(e) = self.engine.apply_update(update).await {
                    debug!(ip = %update.ip, error = %e, "Update not applied");
                }
            }
            ArpMessage::ObserveIp { ip, port } => self.engine.observe_ip(ip, port),
            ArpMessage::Tick => self.engine.tick().await,
            ArpMessage::RebuildSnapshot { done } => {
                self.engine.rebuild_snapshot();
                let _ = done.send(());
            }
            ArpMessage::Topology(event) => self.engine.handle_topology(event).await,
            ArpMessage::SetTimeout { secs, reply } => {
                let _ = reply.send(self.engine.set_global_timeout(secs));
            }
            ArpMessage::Resolve {
                ip,
                if_index,
                reply,
            } => {
                let _ = reply.send(self.engine.resolve(ip, if_index).await);
            }
            ArpMessage::RibWithdraw { ip, reply } => {
                let _ = reply.send(self.engine.rib_withdraw(ip).await);
            }
            ArpMessage::Action { request, reply } => {
                let _ = reply.send(self.engine.action(request).await);
            }
            ArpMessage::Get { ip, reply } => {
                let _ = reply.send(self.engine.get(ip));
            }
            ArpMessage::GetBulk { from, count, reply } => {
                let _ = reply.send(Ok(self.engine.get_bulk(from, count)));
            }
        }
    }
}

/// Sends a tick every `period` while the gate is open
pub async fn run_ticker(tx: mpsc::Sender<ArpMessage>, gate: TickGate, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if gate.is_paused() {
            debug!("Aging tick skipped, snapshot busy");
            continue;
        }
        if tx.send(ArpMessage::Tick).await.is_err() {
            break;
        }
    }
}

/// Rebuilds the bulk snapshot order every `period`
pub async fn run_rebuilder(tx: mpsc::Sender<ArpMessage>, gate: TickGate, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        while !gate.try_begin_rebuild() {
            tokio::time::sleep(REBUILD_RETRY_DELAY).await;
        }
        let (done, done_rx) = oneshot::channel();
        let sent = tx.send(ArpMessage::RebuildSnapshot { done }).await.is_ok();
        if sent {
            let _ = done_rx.await;
        }
        gate.end_rebuild();
        if !sent {
            break;
        }
    }
}

/// Request side of the daemon, cheap to clone
#[derive(Clone)]
pub struct ArpClient {
    tx: mpsc::Sender<ArpMessage>,
    gate: TickGate,
    events: broadcast::Sender<NeighborEvent>,
}

impl ArpClient {
    pub fn new(
        tx: mpsc::Sender<ArpMessage>,
        gate: TickGate,
        events: broadcast::Sender<NeighborEvent>,
    ) -> Self {
        Self { tx, gate, events }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ArpMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await?;
        rx.await?
    }

    /// Returns false when the timeout already had that value
    pub async fn set_global_timeout(&self, secs: u32) -> Result<bool> {
        self.request(|reply| ArpMessage::SetTimeout { secs, reply })
            .await
    }

    pub async fn resolve(&self, ip: &str, if_index: IfIndex) -> Result<()> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| ArpdError::InvalidAddress(ip.to_string()))?;
        self.request(|reply| ArpMessage::Resolve {
            ip,
            if_index,
            reply,
        })
        .await
    }

    pub async fn rib_withdraw(&self, ip: Ipv4Addr) -> Result<()> {
        self.request(|reply| ArpMessage::RibWithdraw { ip, reply })
            .await
    }

    /// Returns the number of entries affected
    pub async fn action(&self, request: ActionRequest) -> Result<usize> {
        self.request(|reply| ArpMessage::Action { request, reply })
            .await
    }

    pub async fn get(&self, ip: Ipv4Addr) -> Result<NeighborState> {
        self.request(|reply| ArpMessage::Get { ip, reply }).await
    }

    /// One page of the bulk snapshot, `CacheBusy` while it is being rebuilt
    pub async fn get_bulk(&self, from: usize, count: usize) -> Result<BulkPage> {
        let _guard = self.gate.try_begin_read().ok_or(ArpdError::CacheBusy)?;
        self.request(|reply| ArpMessage::GetBulk { from, count, reply })
            .await
    }

    pub async fn notify_topology(&self, event: TopologyEvent) -> Result<()> {
        self.tx.send(ArpMessage::Topology(event)).await?;
        Ok(())
    }

    /// Binding changes published by the dispatcher
    pub fn subscribe(&self) -> broadcast::Receiver<NeighborEvent> {
        self.events.subscribe()
    }

    pub fn tick_gate(&self) -> &TickGate {
        &self.gate
    }
}

/// Feeds hardware-plane notifications to the dispatcher until either side closes
pub async fn forward_notifications<S: NotificationSource>(mut source: S, client: ArpClient) {
    while let Some(event) = source.next_event().await {
        debug!(?event, "Topology notification");
        if client.notify_topology(event).await.is_err() {
            return;
        }
    }
    warn!("Notification bus closed, topology changes no longer tracked");
}

/// External collaborators of a running daemon
pub struct ArpDeps {
    pub hardware: Arc<dyn HardwarePlane>,
    pub store: Arc<dyn NeighborStore>,
    pub io: Arc<dyn PacketIo>,
    pub topology: Arc<dyn TopologySource>,
}

/// Daemon assembly
pub struct ArpDaemon;

impl ArpDaemon {
    /// Loads topology, reloads persisted neighbors and spawns the dispatcher
    /// and its timers
    ///
    /// The timers run for the life of the runtime; dropping every client
    /// stops neither of them.
    #[instrument(skip_all)]
    pub async fn start(config: ArpdConfig, deps: ArpDeps) -> Result<ArpClient> {
        config.validate()?;
        let snapshot = fetch_topology(deps.topology.as_ref()).await?;
        let mirror = TopologyMirror::from_snapshot(snapshot);

        let (tx, rx) = mpsc::channel(config.dispatcher.queue_depth);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut engine = ArpEngine::new(
            &config,
            mirror,
            EngineContext {
                hardware: deps.hardware,
                store: deps.store,
                io: deps.io,
                dispatch: tx.clone(),
                events: events.clone(),
            },
        );
        engine.bootstrap().await;

        let gate = TickGate::new();
        tokio::spawn(ArpServer::new(engine, rx).run());
        tokio::spawn(run_ticker(
            tx.clone(),
            gate.clone(),
            config.aging.tick_interval(),
        ));
        tokio::spawn(run_rebuilder(
            tx.clone(),
            gate.clone(),
            config.rebuild_interval(),
        ));
        info!(
            timeout_secs = config.aging.timeout_secs,
            granularity_secs = config.aging.granularity_secs,
            "ARP daemon started"
        );

        Ok(ArpClient::new(tx, gate, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_rebuild_excludes_reads() {
        let gate = TickGate::new();
        assert!(!gate.is_paused());

        assert!(gate.try_begin_rebuild());
        assert!(gate.is_paused());
        assert!(gate.try_begin_read().is_none());
        assert!(!gate.try_begin_rebuild());

        gate.end_rebuild();
        assert!(!gate.is_paused());
        assert!(gate.try_begin_read().is_some());
    }

    #[test]
    fn test_gate_reads_block_rebuild() {
        let gate = TickGate::new();
        let first = gate.try_begin_read().unwrap();
        let second = gate.try_begin_read().unwrap();
        assert!(gate.is_paused());
        assert!(!gate.try_begin_rebuild());

        drop(first);
        assert!(!gate.try_begin_rebuild());
        drop(second);
        assert!(gate.try_begin_rebuild());
    }

    #[tokio::test]
    async fn test_client_bulk_busy_during_rebuild() {
        let (tx, _rx) = mpsc::channel(4);
        let (events, _) = broadcast::channel(4);
        let client = ArpClient::new(tx, TickGate::new(), events);

        assert!(client.tick_gate().try_begin_rebuild());
        assert!(matches!(
            client.get_bulk(0, 10).await,
            Err(ArpdError::CacheBusy)
        ));
    }

    #[tokio::test]
    async fn test_client_rejects_malformed_address() {
        let (tx, _rx) = mpsc::channel(4);
        let (events, _) = broadcast::channel(4);
        let client = ArpClient::new(tx, TickGate::new(), events);
        assert!(matches!(
            client.resolve("10.0.0.300", 1).await,
            Err(ArpdError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_client_reports_closed_dispatcher() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let (events, _) = broadcast::channel(4);
        let client = ArpClient::new(tx, TickGate::new(), events);
        assert!(matches!(
            client.get(Ipv4Addr::new(10, 0, 0, 1)).await,
            Err(ArpdError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_notifications_reach_dispatcher() {
        let (tx, mut rx) = mpsc::channel(4);
        let (events, _) = broadcast::channel(4);
        let client = ArpClient::new(tx, TickGate::new(), events);
        let (bus, source) = mpsc::channel(4);
        let forwarder = tokio::spawn(forward_notifications(source, client));

        let event = TopologyEvent::LinkState { port: 1, up: false };
        bus.send(event.clone()).await.unwrap();
        match rx.recv().await.unwrap() {
            ArpMessage::Topology(received) => assert_eq!(received, event),
            other => panic!("unexpected message {:?}", other),
        }

        drop(bus);
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_ticker_skips_while_paused() {
        let (tx, mut rx) = mpsc::channel(16);
        let gate = TickGate::new();
        assert!(gate.try_begin_rebuild());
        let ticker = tokio::spawn(run_ticker(tx, gate.clone(), Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());

        gate.end_rebuild();
        assert!(matches!(rx.recv().await, Some(ArpMessage::Tick)));
        ticker.abort();
    }
}
