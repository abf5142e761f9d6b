//! Leader Election Service
//!
//! One leader per machine type. Every participant heartbeats its own machine
//! row; the first to flip the per-type leader flag leads and sweeps stale
//! machines, the rest follow and watch the leader's heartbeat.

use async_trait::async_trait;
use chorus_shared::{
    store_call, ChorusError, ChorusResult, CoordinationConfig, MachineId, MembershipEvent,
    MembershipStore,
};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Election state of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Starting,
    Follower,
    /// Held until the election is destroyed
    Leader,
    Stopped,
}

/// Identity handed to leader callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderContext {
    pub machine_id: MachineId,
    pub machine_type: String,
}

/// Hooks invoked by the election on behalf of the calling service
#[async_trait]
pub trait LeaderCallbacks: Send + Sync {
    async fn on_leader_start(&self, _ctx: &LeaderContext) {}

    /// Runs after each sweep while leading
    async fn on_leader_tick(&self, _ctx: &LeaderContext) {}

    /// `machine_id` was found stale and its row deleted by this machine
    async fn on_machine_offline(&self, ctx: &LeaderContext, machine_id: &MachineId);
}

/// Callbacks that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

#[async_trait]
impl LeaderCallbacks for NoopCallbacks {
    async fn on_machine_offline(&self, ctx: &LeaderContext, machine_id: &MachineId) {
        info!("{} observed {} go offline", ctx.machine_id, machine_id);
    }
}

struct ElectionInner {
    ctx: LeaderContext,
    config: CoordinationConfig,
    membership: Arc<dyn MembershipStore>,
    callbacks: Arc<dyn LeaderCallbacks>,
    state: watch::Sender<LeadershipState>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LeaderElection {
    inner: Arc<ElectionInner>,
}

impl LeaderElection {
    /// Register `machine_id` and join the election for `machine_type`.
    ///
    /// Failing to create the machine row is fatal and returned; everything
    /// after that runs in background tasks that absorb store errors.
    pub async fn start(
        machine_id: MachineId,
        machine_type: &str,
        membership: Arc<dyn MembershipStore>,
        callbacks: Arc<dyn LeaderCallbacks>,
        config: CoordinationConfig,
    ) -> ChorusResult<Self> {
        // Subscribe first so nothing between registration and following is missed
        let events = membership.subscribe();

        store_call(
            config.store_timeout,
            "create_machine",
            membership.create_machine(&machine_id, machine_type),
        )
        .await?;
        info!("Registered machine {} ({})", machine_id, machine_type);

        let (state, _) = watch::channel(LeadershipState::Starting);
        let inner = Arc::new(ElectionInner {
            ctx: LeaderContext {
                machine_id,
                machine_type: machine_type.to_string(),
            },
            config,
            membership,
            callbacks,
            state,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let heartbeat = tokio::spawn(inner.clone().heartbeat_loop());
        let election = tokio::spawn(inner.clone().run(events));
        inner.tasks.lock().await.extend([heartbeat, election]);

        Ok(Self { inner })
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.inner.ctx.machine_id
    }

    pub fn machine_type(&self) -> &str {
        &self.inner.ctx.machine_type
    }

    pub fn state(&self) -> LeadershipState {
        *self.inner.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeadershipState::Leader
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LeadershipState> {
        self.inner.state.subscribe()
    }

    /// Stop all loops and delete this machine's row. Leadership is not handed
    /// off; followers find the vacancy through the staleness check.
    pub async fn destroy(&self) -> ChorusResult<()> {
        self.stop_tasks().await;
        let deleted = store_call(
            self.inner.config.store_timeout,
            "delete_machine",
            self.inner.membership.delete_machine(&self.inner.ctx.machine_id),
        )
        .await?;
        info!(
            "Election for {} destroyed (row deleted: {})",
            self.inner.ctx.machine_id, deleted
        );
        Ok(())
    }

    /// Stop all loops and leave the machine row to go stale
    pub async fn abandon(&self) {
        self.stop_tasks().await;
        warn!("Election for {} abandoned", self.inner.ctx.machine_id);
    }

    async fn stop_tasks(&self) {
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Election task panicked: {}", e);
                }
            }
        }
        self.inner.state.send_replace(LeadershipState::Stopped);
    }
}

impl ElectionInner {
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let touched = store_call(
                        self.config.store_timeout,
                        "touch_machine",
                        self.membership.touch_machine(&self.ctx.machine_id),
                    )
                    .await;
                    match touched {
                        Ok(()) => {}
                        Err(ChorusError::MachineNotFound { .. }) => {
                            error!(
                                "Machine row for {} was removed; this machine is considered offline",
                                self.ctx.machine_id
                            );
                        }
                        Err(e) => warn!("Heartbeat for {} failed: {}", self.ctx.machine_id, e),
                    }
                }
            }
        }
        debug!("Heartbeat loop for {} stopped", self.ctx.machine_id);
    }

    async fn run(self: Arc<Self>, events: broadcast::Receiver<MembershipEvent>) {
        let elected = match self.try_become_leader().await {
            Ok(elected) => elected,
            Err(e) => {
                warn!("Initial leadership attempt failed: {}", e);
                false
            }
        };

        if !elected {
            self.state.send_replace(LeadershipState::Follower);
            info!("{} following for type {}", self.ctx.machine_id, self.ctx.machine_type);
            if !self.follow(events).await {
                return;
            }
        }

        self.lead().await;
    }

    async fn try_become_leader(&self) -> ChorusResult<bool> {
        store_call(
            self.config.store_timeout,
            "try_set_leader",
            self.membership
                .try_set_leader(&self.ctx.machine_id, &self.ctx.machine_type),
        )
        .await
    }

    /// Wait for a leader vacancy. Returns `true` once this machine has won
    /// leadership, `false` if shut down first.
    async fn follow(&self, events: broadcast::Receiver<MembershipEvent>) -> bool {
        let mut events = Some(events);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.wait_for_change(&mut events) => {}
            }

            match self.check_leader().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("Follower check for {} failed: {}", self.ctx.machine_type, e),
            }
        }
    }

    /// Sleep until a membership event for this type arrives or the poll interval elapses
    async fn wait_for_change(&self, events: &mut Option<broadcast::Receiver<MembershipEvent>>) {
        let poll = self.config.follower_poll_interval;
        let Some(receiver) = events.as_mut() else {
            tokio::time::sleep(poll).await;
            return;
        };

        let machine_type = self.ctx.machine_type.as_str();
        let closed = tokio::time::timeout(poll, async {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.machine_type() == machine_type => return false,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Missed {} membership events", skipped);
                        return false;
                    }
                    Err(RecvError::Closed) => return true,
                }
            }
        })
        .await
        .unwrap_or(false);

        if closed {
            warn!("Membership notifications closed, falling back to polling");
            *events = None;
        }
    }

    /// One follower check; `true` when this machine is now leader
    async fn check_leader(&self) -> ChorusResult<bool> {
        let timeout = self.config.store_timeout;
        let leader = store_call(
            timeout,
            "get_leader_for_type",
            self.membership.get_leader_for_type(&self.ctx.machine_type),
        )
        .await?;

        match leader {
            None => {
                debug!("No leader recorded for {}", self.ctx.machine_type);
            }
            Some(leader) if leader.id == self.ctx.machine_id => return Ok(true),
            Some(leader) => {
                let live = store_call(
                    timeout,
                    "is_machine_live",
                    self.membership
                        .is_machine_live(&leader.id, self.config.staleness_threshold),
                )
                .await?;
                if live {
                    return Ok(false);
                }

                warn!("Leader {} for {} is stale", leader.id, self.ctx.machine_type);
                let deleted = store_call(
                    timeout,
                    "delete_machine",
                    self.membership.delete_machine(&leader.id),
                )
                .await?;
                if deleted {
                    self.callbacks.on_machine_offline(&self.ctx, &leader.id).await;
                }
            }
        }

        self.try_become_leader().await
    }

    async fn lead(&self) {
        self.state.send_replace(LeadershipState::Leader);
        info!("👑 {} is now leader for {}", self.ctx.machine_id, self.ctx.machine_type);
        self.callbacks.on_leader_start(&self.ctx).await;

        let tick = self.config.leader_tick_interval;
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired_machines().await {
                        warn!("Leader sweep for {} failed: {}", self.ctx.machine_type, e);
                    }
                    self.callbacks.on_leader_tick(&self.ctx).await;
                }
            }
        }
        debug!("Leader loop for {} stopped", self.ctx.machine_id);
    }

    async fn sweep_expired_machines(&self) -> ChorusResult<()> {
        let timeout = self.config.store_timeout;
        let expired = store_call(
            timeout,
            "get_expired_machines",
            self.membership
                .get_expired_machines(&self.ctx.machine_type, self.config.staleness_threshold),
        )
        .await?;

        for machine in expired {
            if machine.id == self.ctx.machine_id {
                continue;
            }
            let deleted = store_call(
                timeout,
                "delete_machine",
                self.membership.delete_machine(&machine.id),
            )
            .await;
            match deleted {
                Ok(true) => {
                    info!("Machine {} went offline", machine.id);
                    self.callbacks.on_machine_offline(&self.ctx, &machine.id).await;
                }
                Ok(false) => debug!("Machine {} already removed", machine.id),
                Err(e) => warn!("Could not remove stale machine {}: {}", machine.id, e),
            }
        }
        Ok(())
    }
}
