//! Shared in-memory cluster harness for integration tests
//!
//! Routes view control commands between managers through the real wire
//! codec, with per-node membership so tests can choreograph partitions,
//! merges, and crashes.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use cacheviews::protocol::{read_message, write_message};
use cacheviews::{
    CacheMembershipListener, CacheView, CacheViewsConfig, CacheViewsManager, ClusterViewEvent,
    CommandHandler, NodeAddress, PeerResponse, ResponseMode, Transport, TransportError,
    TransportResult, ViewControlCommand, ViewsError, ViewsResult,
};

pub fn addr(n: u8) -> NodeAddress {
    NodeAddress::from_bytes([n; 16])
}

pub fn test_config() -> CacheViewsConfig {
    CacheViewsConfig {
        timeout: Duration::from_secs(2),
        view_change_cooldown: Duration::from_millis(10),
    }
}

#[derive(Default)]
struct Faults {
    /// Nodes that neither receive nor deliver any command
    unreachable: HashSet<NodeAddress>,
    /// Nodes that answer recovery requests with a failure
    fail_recover: HashSet<NodeAddress>,
    /// Nodes that silently drop the next command sent to them, once
    black_hole_once: HashSet<NodeAddress>,
}

/// Shared routing fabric: knows every node's command handler and the
/// current fault plan. Commands cross it serialized, exactly as they
/// would cross a socket.
pub struct ClusterNet {
    handlers: DashMap<NodeAddress, Arc<dyn CommandHandler>>,
    faults: Mutex<Faults>,
}

impl ClusterNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            faults: Mutex::new(Faults::default()),
        })
    }

    pub fn register(&self, address: NodeAddress, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(address, handler);
    }

    pub fn make_unreachable(&self, address: NodeAddress) {
        self.faults.lock().unreachable.insert(address);
    }

    pub fn make_reachable(&self, address: NodeAddress) {
        self.faults.lock().unreachable.remove(&address);
    }

    pub fn fail_recovery_from(&self, address: NodeAddress) {
        self.faults.lock().fail_recover.insert(address);
    }

    pub fn heal_recovery_from(&self, address: NodeAddress) {
        self.faults.lock().fail_recover.remove(&address);
    }

    /// Drop the next command delivered to this node: the sender gets no
    /// answer at all and runs into its invocation timeout
    pub fn black_hole_next(&self, address: NodeAddress) {
        self.faults.lock().black_hole_once.insert(address);
    }

    async fn deliver(
        &self,
        target: NodeAddress,
        command: &ViewControlCommand,
    ) -> TransportResult<PeerResponse> {
        let swallowed = {
            let mut faults = self.faults.lock();
            if faults.unreachable.contains(&target) || faults.unreachable.contains(&command.sender())
            {
                return Err(TransportError::NodeUnreachable(target));
            }
            if faults.fail_recover.contains(&target)
                && matches!(command, ViewControlCommand::RecoverViews { .. })
            {
                return Ok(PeerResponse::Failed("recovery state not available".to_string()));
            }
            faults.black_hole_once.remove(&target)
        };
        if swallowed {
            // neither the command nor any response goes through; the caller
            // is left waiting on its timeout
            std::future::pending::<()>().await;
        }

        // round-trip through the wire codec, like a real socket would
        let mut frame = Vec::new();
        write_message(&mut frame, command).await?;
        let mut cursor = frame.as_slice();
        let command: ViewControlCommand = match read_message(&mut cursor).await? {
            Some(command) => command,
            None => return Err(TransportError::ChannelClosed),
        };

        let handler = match self.handlers.get(&target) {
            Some(entry) => entry.value().clone(),
            None => return Err(TransportError::NodeUnreachable(target)),
        };
        match handler.handle_command(command).await {
            Ok(response) => Ok(PeerResponse::Success(response)),
            Err(e) => Ok(PeerResponse::Failed(e.to_string())),
        }
    }
}

/// One node's view of the cluster: its own member list and event stream,
/// delivering through the shared [`ClusterNet`]
pub struct SimTransport {
    local: NodeAddress,
    members: RwLock<Vec<NodeAddress>>,
    events: broadcast::Sender<ClusterViewEvent>,
    net: Arc<ClusterNet>,
}

impl SimTransport {
    pub fn new(local: NodeAddress, members: Vec<NodeAddress>, net: Arc<ClusterNet>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            local,
            members: RwLock::new(members),
            events,
            net,
        })
    }

    pub fn set_members(&self, members: Vec<NodeAddress>) {
        *self.members.write() = members;
    }

    pub fn emit(&self, members: Vec<NodeAddress>, is_merge: bool, is_initial: bool) {
        self.set_members(members.clone());
        let _ = self.events.send(ClusterViewEvent {
            members,
            is_merge,
            is_initial,
        });
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn local_address(&self) -> NodeAddress {
        self.local
    }

    fn members(&self) -> Vec<NodeAddress> {
        self.members.read().clone()
    }

    fn coordinator(&self) -> Option<NodeAddress> {
        self.members.read().first().copied()
    }

    fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.local)
    }

    async fn invoke_remotely(
        &self,
        targets: Option<Vec<NodeAddress>>,
        command: ViewControlCommand,
        mode: ResponseMode,
        timeout: Duration,
    ) -> TransportResult<HashMap<NodeAddress, PeerResponse>> {
        let targets: Vec<NodeAddress> = targets
            .unwrap_or_else(|| self.members())
            .into_iter()
            .filter(|target| *target != self.local)
            .collect();
        match mode {
            ResponseMode::Synchronous => {
                let mut responses = HashMap::new();
                for target in targets {
                    let response =
                        match tokio::time::timeout(timeout, self.net.deliver(target, &command))
                            .await
                        {
                            Ok(delivered) => delivered?,
                            Err(_) => return Err(TransportError::Timeout(timeout)),
                        };
                    responses.insert(target, response);
                }
                Ok(responses)
            }
            ResponseMode::Asynchronous => {
                let net = self.net.clone();
                tokio::spawn(async move {
                    for target in targets {
                        let _ = tokio::time::timeout(timeout, net.deliver(target, &command)).await;
                    }
                });
                Ok(HashMap::new())
            }
        }
    }

    fn subscribe_view_events(&self) -> broadcast::Receiver<ClusterViewEvent> {
        self.events.subscribe()
    }
}

/// What a listener observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Prepared {
        view_id: i64,
        members: Vec<NodeAddress>,
        last_committed_id: i64,
    },
    Committed {
        view_id: i64,
    },
    RolledBack {
        committed_view_id: i64,
    },
    LeaversUpdated {
        leavers: Vec<NodeAddress>,
    },
}

/// Listener that records every hook invocation and can veto one prepare
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
    veto_next: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            veto_next: AtomicBool::new(false),
        })
    }

    pub fn veto_next_prepare(&self) {
        self.veto_next.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    pub fn committed_ids(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ListenerEvent::Committed { view_id } => Some(view_id),
                _ => None,
            })
            .collect()
    }

    pub fn rollback_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ListenerEvent::RolledBack { .. }))
            .count()
    }

    pub fn leaver_updates(&self) -> Vec<Vec<NodeAddress>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ListenerEvent::LeaversUpdated { leavers } => Some(leavers),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CacheMembershipListener for RecordingListener {
    async fn prepare_view(&self, pending: &CacheView, committed: &CacheView) -> ViewsResult<()> {
        if self.veto_next.swap(false, Ordering::SeqCst) {
            return Err(ViewsError::Listener("rejected by test listener".to_string()));
        }
        self.events.lock().push(ListenerEvent::Prepared {
            view_id: pending.view_id,
            members: pending.members.clone(),
            last_committed_id: committed.view_id,
        });
        Ok(())
    }

    async fn commit_view(&self, view_id: i64) {
        self.events.lock().push(ListenerEvent::Committed { view_id });
    }

    async fn rollback_view(&self, committed_view_id: i64) {
        self.events
            .lock()
            .push(ListenerEvent::RolledBack { committed_view_id });
    }

    async fn update_leavers(&self, leavers: HashSet<NodeAddress>) {
        let mut leavers: Vec<NodeAddress> = leavers.into_iter().collect();
        leavers.sort();
        self.events
            .lock()
            .push(ListenerEvent::LeaversUpdated { leavers });
    }
}

/// Every commit must land on a view the listener accepted earlier, and
/// committed ids must only ever grow
pub fn verify_hook_ordering(events: &[ListenerEvent]) {
    let mut prepared: HashSet<i64> = HashSet::new();
    let mut last_committed = i64::MIN;
    for event in events {
        match event {
            ListenerEvent::Prepared { view_id, .. } => {
                prepared.insert(*view_id);
            }
            ListenerEvent::Committed { view_id } => {
                assert!(
                    prepared.contains(view_id),
                    "view {} committed without a preceding prepare: {:?}",
                    view_id,
                    events
                );
                assert!(
                    *view_id > last_committed,
                    "committed view ids went backwards: {:?}",
                    events
                );
                last_committed = *view_id;
            }
            ListenerEvent::RolledBack { .. } | ListenerEvent::LeaversUpdated { .. } => {}
        }
    }
}

pub struct TestNode {
    pub address: NodeAddress,
    pub transport: Arc<SimTransport>,
    pub manager: CacheViewsManager,
}

impl TestNode {
    /// Join a cache with a fresh recording listener
    pub async fn join_recording(&self, cache: &str) -> Arc<RecordingListener> {
        let listener = RecordingListener::new();
        self.manager.join(cache, listener.clone()).await.unwrap();
        listener
    }
}

pub struct TestCluster {
    pub net: Arc<ClusterNet>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Build `count` nodes with ascending addresses, all seeing the full
    /// member list. Node 0 is the coordinator. Nothing is started yet.
    pub fn new(count: usize) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let net = ClusterNet::new();
        let addresses: Vec<NodeAddress> = (0..count).map(|i| addr(i as u8 + 1)).collect();
        let nodes: Vec<TestNode> = addresses
            .iter()
            .map(|&address| {
                let transport = SimTransport::new(address, addresses.clone(), net.clone());
                let manager = CacheViewsManager::new(transport.clone(), test_config());
                net.register(address, Arc::new(manager.clone()));
                TestNode {
                    address,
                    transport,
                    manager,
                }
            })
            .collect();
        Self { net, nodes }
    }

    pub async fn start_all(&self) {
        let results =
            futures::future::join_all(self.nodes.iter().map(|node| node.manager.start())).await;
        for result in results {
            result.unwrap();
        }
    }

    pub async fn stop_all(&self) {
        futures::future::join_all(self.nodes.iter().map(|node| node.manager.stop())).await;
    }

    pub fn addr(&self, idx: usize) -> NodeAddress {
        self.nodes[idx].address
    }

    pub fn addrs(&self, indices: &[usize]) -> Vec<NodeAddress> {
        indices.iter().map(|&idx| self.nodes[idx].address).collect()
    }

    /// Restrict one node's cluster view to the given members without
    /// emitting an event; use before starting a partitioned node
    pub fn isolate(&self, idx: usize, members: &[usize]) {
        self.nodes[idx].transport.set_members(self.addrs(members));
    }

    /// Deliver a membership event to one node
    pub fn emit(&self, idx: usize, members: &[usize], is_merge: bool, is_initial: bool) {
        self.nodes[idx]
            .transport
            .emit(self.addrs(members), is_merge, is_initial);
    }

    /// Make a node drop off the network: survivors see a shrunken cluster
    /// and the crashed node stops exchanging commands
    pub fn crash(&self, idx: usize, survivors: &[usize]) {
        self.net.make_unreachable(self.addr(idx));
        for &survivor in survivors {
            self.emit(survivor, survivors, false, false);
        }
    }

    /// Merge every node back into one cluster
    pub fn merge_all(&self, is_merge: bool) {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        for idx in 0..self.nodes.len() {
            self.emit(idx, &all, is_merge, false);
        }
    }
}

/// Poll until the cache's committed view has exactly the given members
pub async fn wait_for_members(
    manager: &CacheViewsManager,
    cache: &str,
    expected: &[NodeAddress],
) -> CacheView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = manager.get_committed_view(cache);
        if let Some(view) = &view {
            if view.members == expected {
                return view.clone();
            }
        }
        if Instant::now() > deadline {
            panic!(
                "cache {} never reached members {:?}, last committed view: {:?}",
                cache, expected, view
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the cache's committed view has the given members in any
/// order; nodes agree on one order, but it depends on request arrival
pub async fn wait_for_member_set(
    manager: &CacheViewsManager,
    cache: &str,
    expected: &[NodeAddress],
) -> CacheView {
    let mut expected: Vec<NodeAddress> = expected.to_vec();
    expected.sort();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = manager.get_committed_view(cache);
        if let Some(view) = &view {
            let mut members = view.members.clone();
            members.sort();
            if members == expected {
                return view.clone();
            }
        }
        if Instant::now() > deadline {
            panic!(
                "cache {} never reached member set {:?}, last committed view: {:?}",
                cache, expected, view
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the cache's committed view id reaches at least `min_id`
pub async fn wait_for_view_id(manager: &CacheViewsManager, cache: &str, min_id: i64) -> CacheView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = manager.get_committed_view(cache);
        if let Some(view) = &view {
            if view.view_id >= min_id {
                return view.clone();
            }
        }
        if Instant::now() > deadline {
            panic!(
                "cache {} never reached view id {}, last committed view: {:?}",
                cache, min_id, view
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
