//! Cluster-wide coordination of cache membership views
//!
//! [`CacheViewsManager`] keeps one agreed view per named cache and installs
//! new ones through a two-phase protocol driven by the cluster coordinator:
//! a prepare broadcast that every target must accept, followed by a commit
//! on unanimous success or a rollback on any failure. A single trigger loop
//! batches join and leave requests, detects leavers, and submits one
//! installation task per cache. When this node takes over as coordinator it
//! first runs a recovery round that reconciles the views the surviving
//! nodes report.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ViewsError, ViewsResult};
use crate::info::CacheViewInfo;
use crate::listener::CacheMembershipListener;
use crate::protocol::{CommandResponse, PeerResponse, ViewControlCommand};
use crate::transport::{CommandHandler, ResponseMode, Transport};
use crate::trigger::{self, ViewTrigger};
use crate::types::{CacheView, CacheViewsConfig, CacheViewsStats, NodeAddress, EMPTY_VIEW_ID};

/// Cluster-role snapshot. Written only by the membership handler; the
/// member list is assigned last so a set recovery flag is always observed
/// together with the members that caused it.
#[derive(Debug, Default)]
struct ClusterState {
    coordinator: Option<NodeAddress>,
    is_coordinator: bool,
    should_recover: bool,
    members: Vec<NodeAddress>,
}

/// Coordinates cache membership views across the cluster.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct CacheViewsManager {
    /// Group transport used for all remote invocations
    transport: Arc<dyn Transport>,

    /// Protocol timeouts and trigger pacing
    config: CacheViewsConfig,

    /// This node's address, cached from the transport
    self_address: NodeAddress,

    /// Per-cache view state; entries are never removed
    views: Arc<DashMap<String, Arc<Mutex<CacheViewInfo>>>>,

    /// Cluster-role snapshot
    cluster: Arc<Mutex<ClusterState>>,

    /// Running flag
    running: Arc<AtomicBool>,

    /// Wake channel feeding the trigger loop
    trigger: Arc<ViewTrigger>,

    /// Handle of the trigger loop task
    trigger_handle: Arc<Mutex<Option<JoinHandle<()>>>>,

    /// Handle of the membership event pump
    event_pump: Arc<Mutex<Option<JoinHandle<()>>>>,

    /// In-flight view installation tasks
    install_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,

    /// Protocol activity counters
    stats: Arc<RwLock<CacheViewsStats>>,
}

impl CacheViewsManager {
    /// Create a manager bound to the given transport
    pub fn new(transport: Arc<dyn Transport>, config: CacheViewsConfig) -> Self {
        let self_address = transport.local_address();
        Self {
            transport,
            config,
            self_address,
            views: Arc::new(DashMap::new()),
            cluster: Arc::new(Mutex::new(ClusterState::default())),
            running: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(ViewTrigger::new()),
            trigger_handle: Arc::new(Mutex::new(None)),
            event_pump: Arc::new(Mutex::new(None)),
            install_tasks: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(RwLock::new(CacheViewsStats::default())),
        }
    }

    /// Start the trigger loop and the membership event pump.
    ///
    /// The event subscription misses the cluster view this node is already
    /// part of, so the current membership snapshot is fed in by hand.
    pub async fn start(&self) -> ViewsResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node = %self.self_address, "starting cache views manager");

        let wake_rx = self.trigger.open();
        let mut events = self.transport.subscribe_view_events();
        self.handle_new_view(&self.transport.members(), false, true);

        let manager = self.clone();
        let trigger_handle = tokio::spawn(async move { manager.trigger_loop(wake_rx).await });
        *self.trigger_handle.lock() = Some(trigger_handle);

        let manager = self.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !manager.is_running() {
                            break;
                        }
                        manager.handle_new_view(&event.members, event.is_merge, event.is_initial);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "membership event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.event_pump.lock() = Some(pump);

        Ok(())
    }

    /// Stop the manager.
    ///
    /// The trigger loop is joined with the configured timeout, then the
    /// in-flight installation tasks are drained within the same deadline.
    /// Remote calls already underway are not cancelled, merely no longer
    /// awaited; the next coordinator's recovery resolves whatever they
    /// leave behind.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.self_address, "stopping cache views manager");
        self.trigger.close();
        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }

        let trigger_handle = self.trigger_handle.lock().take();
        if let Some(handle) = trigger_handle {
            match tokio::time::timeout(self.config.timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "trigger loop task failed"),
                Err(_) => warn!("trigger loop did not stop within the timeout"),
            }
        }

        let deadline = Instant::now() + self.config.timeout;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.install_tasks.lock());
        for task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "view installation task failed"),
                Err(_) => warn!("view installation still in flight at shutdown"),
            }
        }
    }

    /// Whether the manager is started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Join the named cache and register its listener.
    ///
    /// The join is recorded locally first; when this node is not the
    /// coordinator it is also sent to the coordinator, which folds it into
    /// the cache's next view.
    pub async fn join(
        &self,
        cache_name: &str,
        listener: Arc<dyn CacheMembershipListener>,
    ) -> ViewsResult<()> {
        if !self.is_running() {
            return Err(ViewsError::NotRunning);
        }
        debug!(cache = cache_name, node = %self.self_address, "joining cache");
        self.handle_request_join(cache_name, self.self_address);
        if let Some(info) = self.lookup_info(cache_name) {
            info.lock().set_listener(Some(listener));
        }

        let (is_coordinator, coordinator) = {
            let cluster = self.cluster.lock();
            (cluster.is_coordinator, cluster.coordinator)
        };
        if !is_coordinator {
            let coordinator = coordinator
                .ok_or_else(|| ViewsError::Other("cluster coordinator is not known yet".to_string()))?;
            let command = ViewControlCommand::RequestJoin {
                cache_name: cache_name.to_string(),
                sender: self.self_address,
            };
            let responses = self
                .transport
                .invoke_remotely(
                    Some(vec![coordinator]),
                    command,
                    ResponseMode::Synchronous,
                    self.config.timeout,
                )
                .await?;
            self.check_remote_responses(cache_name, &responses)?;
        }
        Ok(())
    }

    /// Leave the named cache.
    ///
    /// Best effort: the leave is applied locally, then broadcast to the
    /// whole cluster without waiting for answers. Failures are logged and
    /// swallowed; leaver detection catches stragglers later.
    pub async fn leave(&self, cache_name: &str) {
        debug!(cache = cache_name, node = %self.self_address, "leaving cache");
        let Some(info) = self.lookup_info(cache_name) else {
            debug!(cache = cache_name, "leave requested for a cache this node never joined");
            return;
        };
        info.lock().set_listener(None);
        self.handle_request_leave(cache_name, self.self_address).await;

        let command = ViewControlCommand::RequestLeave {
            cache_name: cache_name.to_string(),
            sender: self.self_address,
        };
        if let Err(e) = self
            .transport
            .invoke_remotely(None, command, ResponseMode::Asynchronous, self.config.timeout)
            .await
        {
            debug!(cache = cache_name, error = %e, "failed to notify the cluster of the leave");
        }
    }

    /// The committed view of the named cache
    pub fn get_committed_view(&self, cache_name: &str) -> Option<CacheView> {
        self.lookup_info(cache_name)
            .map(|info| info.lock().committed_view().clone())
    }

    /// The prepared view of the named cache awaiting commit or rollback
    pub fn get_pending_view(&self, cache_name: &str) -> Option<CacheView> {
        self.lookup_info(cache_name)
            .and_then(|info| info.lock().pending_view().cloned())
    }

    /// Leavers recorded for the named cache and not yet installed away
    pub fn get_leavers(&self, cache_name: &str) -> Option<HashSet<NodeAddress>> {
        self.lookup_info(cache_name)
            .map(|info| info.lock().pending_changes().leavers().clone())
    }

    /// A snapshot of the protocol activity counters
    pub fn stats(&self) -> CacheViewsStats {
        self.stats.read().clone()
    }

    fn lookup_info(&self, cache_name: &str) -> Option<Arc<Mutex<CacheViewInfo>>> {
        self.views.get(cache_name).map(|entry| entry.value().clone())
    }

    /// View state for the cache, created at bootstrap on first touch.
    /// The entry API makes racing first-touches insert exactly once.
    fn cache_info(&self, cache_name: &str) -> Arc<Mutex<CacheViewInfo>> {
        self.views
            .entry(cache_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CacheViewInfo::new(cache_name))))
            .clone()
    }

    /// Absorb a cluster membership change.
    ///
    /// Recomputes the roles, schedules a recovery round when this node just
    /// took over as coordinator or a partition merge happened, and wakes
    /// the trigger loop.
    fn handle_new_view(&self, members: &[NodeAddress], is_merge: bool, is_initial: bool) {
        trace!(?members, is_merge, is_initial, "cluster membership changed");
        {
            let mut cluster = self.cluster.lock();
            let was_coordinator = cluster.is_coordinator;
            cluster.coordinator = self.transport.coordinator();
            cluster.is_coordinator = self.transport.is_coordinator();
            if cluster.is_coordinator && (is_merge || (!was_coordinator && !is_initial)) {
                cluster.should_recover = true;
                info!(node = %self.self_address, is_merge, "this node is the new coordinator, scheduling view recovery");
            }
            cluster.members = members.to_vec();
        }
        self.trigger.wake();
    }

    /// Read and clear the recovery flag in one step, so a request arriving
    /// while recovery runs is kept for the next cycle
    fn take_recovery_flag(&self) -> bool {
        let mut cluster = self.cluster.lock();
        std::mem::replace(&mut cluster.should_recover, false)
    }

    fn recovery_pending(&self) -> bool {
        self.cluster.lock().should_recover
    }

    async fn trigger_loop(&self, mut wake_rx: mpsc::Receiver<()>) {
        debug!("view trigger loop started");
        while self.is_running() {
            if self.take_recovery_flag() {
                match self.recover_views().await {
                    Ok(()) => self.stats.write().recoveries_completed += 1,
                    Err(e) => {
                        self.stats.write().recoveries_failed += 1;
                        error!(error = %e, "error recovering views after a coordinator change");
                    }
                }
            }
            if !trigger::wait_for_wake(&mut wake_rx, self.config.view_change_cooldown).await {
                break;
            }
            if !self.is_running() {
                break;
            }
            self.trigger_view_installations().await;
        }
        debug!("view trigger loop stopped");
    }

    /// One trigger cycle: detect leavers and submit an installation task
    /// for every cache whose tracker judges a new view necessary
    async fn trigger_view_installations(&self) {
        let (is_coordinator, live_members) = {
            let cluster = self.cluster.lock();
            (cluster.is_coordinator, cluster.members.clone())
        };
        if !is_coordinator {
            return;
        }

        let caches: Vec<(String, Arc<Mutex<CacheViewInfo>>)> = self
            .views
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (cache_name, info) in caches {
            if !self.is_running() {
                return;
            }
            if self.recovery_pending() {
                debug!("view recovery became necessary, postponing view installations");
                return;
            }

            let leavers: Vec<NodeAddress> = {
                let guard = info.lock();
                guard
                    .committed_view()
                    .members
                    .iter()
                    .copied()
                    .filter(|member| !live_members.contains(member))
                    .collect()
            };
            if !leavers.is_empty() {
                self.handle_leavers(&cache_name, leavers).await;
            }

            let pending = {
                let mut guard = info.lock();
                let committed = guard.committed_view().clone();
                guard.pending_changes_mut().create_pending_view(&committed)
            };
            if let Some(view) = pending {
                self.submit_install(cache_name, view);
            }
        }
    }

    fn submit_install(&self, cache_name: String, view: CacheView) {
        debug!(cache = %cache_name, view = %view, "submitting view installation");
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.cluster_install_view(&cache_name, view).await;
        });
        let mut tasks = self.install_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Install one view: prepare everywhere, then commit on unanimous
    /// success or roll back on any failure. Skips the resolution step when
    /// the manager is stopping; the next coordinator's recovery resolves
    /// the leftover prepares.
    async fn cluster_install_view(&self, cache_name: &str, view: CacheView) {
        let success = match self.cluster_prepare_view(cache_name, &view).await {
            Ok(()) => true,
            Err(e) => {
                debug!(cache = cache_name, view_id = view.view_id, error = %e, "error preparing view");
                false
            }
        };
        if !self.is_running() {
            debug!(cache = cache_name, "manager is stopping, skipping view resolution");
            return;
        }
        if success {
            self.cluster_commit_view(cache_name, view.view_id, view.members.clone(), true)
                .await;
            self.stats.write().views_installed += 1;
        } else {
            let committed_view_id = self
                .lookup_info(cache_name)
                .map(|info| info.lock().committed_view().view_id)
                .unwrap_or(EMPTY_VIEW_ID);
            self.cluster_rollback_view(cache_name, committed_view_id, view.members, true)
                .await;
            self.stats.write().views_rolled_back += 1;
        }
    }

    /// First phase: broadcast the pending view to its members and run the
    /// local prepare handler concurrently. Known leavers are skipped. Any
    /// refusal or timeout fails the phase.
    async fn cluster_prepare_view(&self, cache_name: &str, pending_view: &CacheView) -> ViewsResult<()> {
        let info = self
            .lookup_info(cache_name)
            .ok_or_else(|| ViewsError::CacheNotFound(cache_name.to_string()))?;
        let (committed_view, leavers) = {
            let guard = info.lock();
            (
                guard.committed_view().clone(),
                guard.pending_changes().leavers().clone(),
            )
        };
        debug!(cache = cache_name, view = %pending_view, "preparing view");

        let targets: Vec<NodeAddress> = pending_view
            .members
            .iter()
            .copied()
            .filter(|member| !leavers.contains(member))
            .collect();
        let command = ViewControlCommand::PrepareView {
            cache_name: cache_name.to_string(),
            sender: self.self_address,
            pending_view: pending_view.clone(),
            committed_view: committed_view.clone(),
        };

        // remote prepares run while the local one executes
        let transport = self.transport.clone();
        let timeout = self.config.timeout;
        let remote = tokio::spawn(async move {
            transport
                .invoke_remotely(Some(targets), command, ResponseMode::Synchronous, timeout)
                .await
        });

        self.handle_prepare_view(cache_name, pending_view.clone(), committed_view)
            .await?;

        let responses = remote
            .await
            .map_err(|e| ViewsError::Other(format!("prepare broadcast task failed: {}", e)))??;
        self.check_remote_responses(cache_name, &responses)?;
        Ok(())
    }

    /// Second phase, success: tell the targets to promote the prepared
    /// view. Failures are logged, never retried within this installation.
    async fn cluster_commit_view(
        &self,
        cache_name: &str,
        view_id: i64,
        targets: Vec<NodeAddress>,
        include_coordinator: bool,
    ) {
        let Some(info) = self.lookup_info(cache_name) else {
            trace!(cache = cache_name, "ignoring commit for unknown cache");
            return;
        };
        let leavers = info.lock().pending_changes().leavers().clone();
        let valid_targets: Vec<NodeAddress> = targets
            .iter()
            .copied()
            .filter(|target| !leavers.contains(target))
            .collect();
        debug!(cache = cache_name, view_id, ?valid_targets, "committing view");

        let command = ViewControlCommand::CommitView {
            cache_name: cache_name.to_string(),
            sender: self.self_address,
            view_id,
        };
        match self
            .transport
            .invoke_remotely(
                Some(valid_targets.clone()),
                command,
                ResponseMode::Synchronous,
                self.config.timeout,
            )
            .await
        {
            Ok(responses) => {
                for (node, response) in &responses {
                    if let PeerResponse::Failed(details) = response {
                        warn!(cache = cache_name, node = %node, details, "error response to view commit");
                    }
                }
            }
            Err(e) => warn!(cache = cache_name, view_id, error = %e, "error broadcasting view commit"),
        }

        if include_coordinator || valid_targets.contains(&self.self_address) {
            self.handle_commit_view(cache_name, view_id).await;
        }
    }

    /// Second phase, failure: tell every node that might have prepared to
    /// discard the pending view. The rollback burns a fresh view id so the
    /// aborted attempt can never be confused with a later one.
    async fn cluster_rollback_view(
        &self,
        cache_name: &str,
        committed_view_id: i64,
        targets: Vec<NodeAddress>,
        include_coordinator: bool,
    ) {
        let Some(info) = self.lookup_info(cache_name) else {
            trace!(cache = cache_name, "ignoring rollback for unknown cache");
            return;
        };
        let (new_view_id, leavers) = {
            let mut guard = info.lock();
            let new_view_id = guard.pending_changes_mut().rollback_view_id();
            let leavers = guard.pending_changes().leavers().clone();
            (new_view_id, leavers)
        };
        let valid_targets: Vec<NodeAddress> = targets
            .iter()
            .copied()
            .filter(|target| !leavers.contains(target))
            .collect();
        debug!(
            cache = cache_name,
            new_view_id, committed_view_id, ?valid_targets, "rolling back view installation"
        );

        let command = ViewControlCommand::RollbackView {
            cache_name: cache_name.to_string(),
            sender: self.self_address,
            new_view_id,
            committed_view_id,
        };
        match self
            .transport
            .invoke_remotely(
                Some(valid_targets.clone()),
                command,
                ResponseMode::Synchronous,
                self.config.timeout,
            )
            .await
        {
            Ok(responses) => {
                for (node, response) in &responses {
                    if let PeerResponse::Failed(details) = response {
                        warn!(cache = cache_name, node = %node, details, "error response to view rollback");
                    }
                }
            }
            Err(e) => warn!(cache = cache_name, new_view_id, error = %e, "error broadcasting view rollback"),
        }

        if include_coordinator || valid_targets.contains(&self.self_address) {
            self.handle_rollback_view(cache_name, new_view_id, committed_view_id)
                .await;
        }
    }

    /// Scan per-target outcomes; any failed target fails the whole command.
    /// Targets missing from the map answered nothing and are ignored.
    fn check_remote_responses(
        &self,
        cache_name: &str,
        responses: &HashMap<NodeAddress, PeerResponse>,
    ) -> ViewsResult<()> {
        let mut failure = None;
        for (node, response) in responses {
            if let PeerResponse::Failed(details) = response {
                debug!(cache = cache_name, node = %node, details, "received unsuccessful response");
                failure = Some(ViewsError::RemoteFailure {
                    node: *node,
                    details: details.clone(),
                });
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Reconcile the per-node view state after this node became coordinator.
    ///
    /// Every member reports its committed views; for each cache the
    /// reporters are grouped into partitions by the memberships they
    /// report, each partition's half-finished installation is resolved on
    /// its own, and one unified view over all recovered members is seeded
    /// for the next trigger cycle.
    async fn recover_views(&self) -> ViewsResult<()> {
        info!(node = %self.self_address, "recovering cache views from the cluster");

        let mut reports: HashMap<NodeAddress, HashMap<String, CacheView>> = HashMap::new();
        reports.insert(self.self_address, self.handle_recover_views());

        let command = ViewControlCommand::RecoverViews {
            sender: self.self_address,
        };
        let responses = self
            .transport
            .invoke_remotely(None, command, ResponseMode::Synchronous, self.config.timeout)
            .await
            .map_err(|e| ViewsError::RecoveryFailed(e.to_string()))?;
        for (node, response) in responses {
            match response {
                PeerResponse::Success(CommandResponse::RecoveredViews(views)) => {
                    reports.insert(node, views);
                }
                PeerResponse::Success(other) => {
                    debug!(node = %node, response = ?other, "unexpected recovery response, treating the node as running no caches");
                }
                PeerResponse::Failed(details) => {
                    return Err(ViewsError::RecoveryFailed(format!(
                        "node {} failed to report its views: {}",
                        node, details
                    )));
                }
            }
        }

        let mut cache_names: HashSet<String> = HashSet::new();
        for views in reports.values() {
            cache_names.extend(views.keys().cloned());
        }
        debug!(caches = cache_names.len(), nodes = reports.len(), "reconciling recovered views");

        for cache_name in cache_names {
            self.recover_cache_views(&cache_name, &reports).await;
        }
        self.trigger.wake();
        Ok(())
    }

    /// Reconcile one cache from the recovery reports
    async fn recover_cache_views(
        &self,
        cache_name: &str,
        reports: &HashMap<NodeAddress, HashMap<String, CacheView>>,
    ) {
        let mut candidates: Vec<(NodeAddress, &CacheView)> = reports
            .iter()
            .filter_map(|(node, views)| views.get(cache_name).map(|view| (*node, view)))
            .collect();
        // highest view id first; the address breaks ties deterministically
        candidates.sort_by(|a, b| b.1.view_id.cmp(&a.1.view_id).then(a.0.cmp(&b.0)));
        let Some(highest_id) = candidates.first().map(|(_, view)| view.view_id) else {
            return;
        };
        debug!(
            cache = cache_name,
            candidates = candidates.len(),
            highest_id,
            "reconciling cache views"
        );

        // this coordinator may not run the cache itself
        let info = self.cache_info(cache_name);
        info.lock()
            .pending_changes_mut()
            .update_latest_view_id(highest_id + 1);

        // group the reporters into partitions: each unprocessed node claims
        // the reporters its own view says it was with
        let mut pool: Vec<(NodeAddress, &CacheView)> = candidates.clone();
        let mut partitions: Vec<(Vec<NodeAddress>, i64, i64)> = Vec::new();
        while let Some(&(_, head_view)) = pool.first() {
            let partition: Vec<NodeAddress> = head_view
                .members
                .iter()
                .filter(|member| pool.iter().any(|(node, _)| node == *member))
                .copied()
                .collect();
            if partition.is_empty() {
                // the head's view does not even contain the head; it falls
                // through to the joiner sweep below
                pool.remove(0);
                continue;
            }
            let ids: Vec<i64> = pool
                .iter()
                .filter(|(node, _)| partition.contains(node))
                .map(|(_, view)| view.view_id)
                .collect();
            let min_id = ids.iter().copied().min().unwrap_or(head_view.view_id);
            let max_id = ids.iter().copied().max().unwrap_or(head_view.view_id);
            pool.retain(|(node, _)| !head_view.members.contains(node));
            partitions.push((partition, min_id, max_id));
        }

        for (partition, min_id, max_id) in &partitions {
            if min_id == max_id {
                // everyone agrees; a rollback clears half-finished prepares
                self.cluster_rollback_view(cache_name, *max_id, partition.clone(), false)
                    .await;
            } else {
                // finish the most advanced installation within the partition
                self.cluster_commit_view(cache_name, *max_id, partition.clone(), false)
                    .await;
            }
        }

        let mut recovered_members: Vec<NodeAddress> = Vec::new();
        for (partition, _, _) in &partitions {
            for node in partition {
                if !recovered_members.contains(node) {
                    recovered_members.push(*node);
                }
            }
        }
        let joiners: Vec<NodeAddress> = candidates
            .iter()
            .map(|(node, _)| *node)
            .filter(|node| !recovered_members.contains(node))
            .collect();

        info.lock()
            .pending_changes_mut()
            .request_coord_change(recovered_members, joiners);
    }

    fn handle_request_join(&self, cache_name: &str, joiner: NodeAddress) {
        debug!(cache = cache_name, node = %joiner, "join requested");
        let info = self.cache_info(cache_name);
        info.lock().pending_changes_mut().request_join(joiner);
        self.trigger.wake();
    }

    async fn handle_request_leave(&self, cache_name: &str, leaver: NodeAddress) {
        self.handle_leavers(cache_name, vec![leaver]).await;
        self.trigger.wake();
    }

    /// Record leavers and notify the local listener.
    ///
    /// Only the coordinator accumulates leavers in the tracker; every node
    /// with a listener and a committed membership passes the tracker's
    /// current leaver set on, so data migration can start before the next
    /// view commits.
    async fn handle_leavers(&self, cache_name: &str, leavers: Vec<NodeAddress>) {
        let Some(info) = self.lookup_info(cache_name) else {
            trace!(cache = cache_name, "ignoring leavers for unknown cache");
            return;
        };
        trace!(cache = cache_name, ?leavers, "handling leavers");
        let is_coordinator = self.cluster.lock().is_coordinator;
        let (listener, leaver_set, is_member) = {
            let mut guard = info.lock();
            if is_coordinator {
                guard
                    .pending_changes_mut()
                    .request_leave(leavers.iter().copied());
            }
            let is_member = guard.committed_view().contains(&self.self_address);
            (
                guard.listener(),
                guard.pending_changes().leavers().clone(),
                is_member,
            )
        };
        if is_member {
            if let Some(listener) = listener {
                listener.update_leavers(leaver_set).await;
            }
        }
    }

    /// Store a prepared view and ask the local listener to accept it.
    ///
    /// Rejected outright for caches this node knows nothing about and for
    /// views that list neither this node nor a coordinator duty; either
    /// error vetoes the installation cluster-wide.
    async fn handle_prepare_view(
        &self,
        cache_name: &str,
        pending_view: CacheView,
        sender_committed: CacheView,
    ) -> ViewsResult<()> {
        let Some(info) = self.lookup_info(cache_name) else {
            return Err(ViewsError::CacheNotFound(cache_name.to_string()));
        };
        let is_local = pending_view.contains(&self.self_address);
        if !is_local && !self.cluster.lock().is_coordinator {
            return Err(ViewsError::Other(format!(
                "received prepare for view {} of cache {} but this node is not a member",
                pending_view.view_id, cache_name
            )));
        }
        trace!(cache = cache_name, view = %pending_view, "preparing view");

        let (last_committed, listener) = {
            let mut guard = info.lock();
            let last_committed = guard.committed_view().clone();
            if sender_committed.view_id != last_committed.view_id && last_committed.view_id > 0 {
                info!(
                    cache = cache_name,
                    local = %last_committed,
                    remote = %sender_committed,
                    "local committed view differs from the coordinator's, normal during a merge"
                );
            }
            guard.prepare_view(pending_view.clone());
            (last_committed, guard.listener())
        };

        if is_local {
            if let Some(listener) = listener {
                listener.prepare_view(&pending_view, &last_committed).await?;
            }
        }
        Ok(())
    }

    /// Promote the prepared view to committed and reset the tracker
    /// against it. Commit locality is judged by the pending membership.
    async fn handle_commit_view(&self, cache_name: &str, view_id: i64) {
        let Some(info) = self.lookup_info(cache_name) else {
            trace!(cache = cache_name, view_id, "ignoring commit for unknown cache");
            return;
        };
        let (committed, listener, is_local) = {
            let mut guard = info.lock();
            let Some(pending) = guard.pending_view() else {
                trace!(cache = cache_name, view_id, "ignoring commit, no pending view");
                return;
            };
            let is_local = pending.contains(&self.self_address);
            match guard.commit_view(view_id) {
                Some(committed) => {
                    guard.pending_changes_mut().reset_changes(&committed);
                    (committed, guard.listener(), is_local)
                }
                None => {
                    debug!(cache = cache_name, view_id, "commit does not match the pending view");
                    return;
                }
            }
        };
        debug!(cache = cache_name, view = %committed, "committed view");

        if is_local {
            if let Some(listener) = listener {
                listener.commit_view(view_id).await;
            }
        }
    }

    /// Discard the prepared view; the committed view stays in effect.
    /// Rollback locality is judged by the committed membership.
    async fn handle_rollback_view(&self, cache_name: &str, new_view_id: i64, committed_view_id: i64) {
        let Some(info) = self.lookup_info(cache_name) else {
            trace!(cache = cache_name, "ignoring rollback for unknown cache");
            return;
        };
        let (listener, is_local) = {
            let mut guard = info.lock();
            if !guard.has_pending_view() {
                trace!(cache = cache_name, new_view_id, "ignoring rollback, no pending view");
                return;
            }
            let is_local = guard.committed_view().contains(&self.self_address);
            guard.rollback_view(new_view_id);
            let committed = guard.committed_view().clone();
            guard.pending_changes_mut().reset_changes(&committed);
            (guard.listener(), is_local)
        };
        debug!(cache = cache_name, new_view_id, committed_view_id, "rolled back view installation");

        if is_local {
            if let Some(listener) = listener {
                listener.rollback_view(committed_view_id).await;
            }
        }
    }

    /// Committed views of every cache this node is a member of
    fn handle_recover_views(&self) -> HashMap<String, CacheView> {
        let mut recovered = HashMap::new();
        for entry in self.views.iter() {
            let guard = entry.value().lock();
            let committed = guard.committed_view();
            if committed.contains(&self.self_address) {
                recovered.insert(entry.key().clone(), committed.clone());
            }
        }
        recovered
    }
}

#[async_trait]
impl CommandHandler for CacheViewsManager {
    async fn handle_command(&self, command: ViewControlCommand) -> ViewsResult<CommandResponse> {
        trace!(
            cache = command.cache_name().unwrap_or("<global>"),
            sender = %command.sender(),
            ?command,
            "handling view control command"
        );
        if !self.is_running() {
            return Err(ViewsError::NotRunning);
        }
        match command {
            ViewControlCommand::RequestJoin { cache_name, sender } => {
                self.handle_request_join(&cache_name, sender);
                Ok(CommandResponse::Ack)
            }
            ViewControlCommand::RequestLeave { cache_name, sender } => {
                self.handle_request_leave(&cache_name, sender).await;
                Ok(CommandResponse::Ack)
            }
            ViewControlCommand::PrepareView {
                cache_name,
                pending_view,
                committed_view,
                ..
            } => {
                self.handle_prepare_view(&cache_name, pending_view, committed_view)
                    .await?;
                Ok(CommandResponse::Ack)
            }
            ViewControlCommand::CommitView {
                cache_name, view_id, ..
            } => {
                self.handle_commit_view(&cache_name, view_id).await;
                Ok(CommandResponse::Ack)
            }
            ViewControlCommand::RollbackView {
                cache_name,
                new_view_id,
                committed_view_id,
                ..
            } => {
                self.handle_rollback_view(&cache_name, new_view_id, committed_view_id)
                    .await;
                Ok(CommandResponse::Ack)
            }
            ViewControlCommand::RecoverViews { .. } => {
                Ok(CommandResponse::RecoveredViews(self.handle_recover_views()))
            }
        }
    }
}
