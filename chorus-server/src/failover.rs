//! Room Failover Protocol
//!
//! Runs on the leader. When a machine goes offline its rooms are either
//! destroyed (`destroy_on_orphan`) or adopted through a conditional owner
//! update, so that of several would-be adopters exactly one binds the room.
//! The winner then takes over the room's ownership claim from the dead owner.

use crate::election::{LeaderCallbacks, LeaderContext};
use crate::rooms::RoomService;
use async_trait::async_trait;
use chorus_shared::{
    store_call, ChorusResult, CoordinationConfig, MachineId, RoomId, RoomRecord, RoomStore,
    StoreBackend,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one orphaned room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    Destroyed,
    Adopted,
    /// Ownership moved here but the script would not bind; needs an operator
    AdoptedNotBound(String),
    /// Another machine adopted the room first
    LostRace,
    /// Store error; the orphan sweep picks the room up again
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    pub rooms: Vec<(RoomId, FailoverOutcome)>,
}

impl FailoverReport {
    pub fn outcome(&self, room_id: &RoomId) -> Option<&FailoverOutcome> {
        self.rooms
            .iter()
            .find(|(id, _)| id == room_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn count(&self, wanted: fn(&FailoverOutcome) -> bool) -> usize {
        self.rooms.iter().filter(|(_, outcome)| wanted(outcome)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

pub struct RoomFailover {
    machine_id: MachineId,
    rooms: RoomService,
    store: Arc<dyn RoomStore>,
    config: CoordinationConfig,
    ticks: AtomicU32,
}

impl RoomFailover {
    pub fn new(rooms: RoomService, backend: &StoreBackend, config: CoordinationConfig) -> Self {
        Self {
            machine_id: rooms.machine_id().clone(),
            rooms,
            store: backend.rooms.clone(),
            config,
            ticks: AtomicU32::new(0),
        }
    }

    /// Destroy or adopt every room owned by `dead`
    pub async fn handle_machine_offline(&self, dead: &MachineId) -> FailoverReport {
        let mut report = FailoverReport::default();
        let rooms = store_call(
            self.config.store_timeout,
            "get_rooms_by_machine",
            self.store.get_rooms_by_machine(dead),
        )
        .await;
        let rooms = match rooms {
            Ok(rooms) => rooms,
            Err(e) => {
                error!("Could not list rooms of offline machine {}: {}", dead, e);
                return report;
            }
        };

        for record in rooms {
            let room_id = record.room_id.clone();
            let outcome = self.fail_over_room(record, dead).await;
            report.rooms.push((room_id, outcome));
        }
        if !report.is_empty() {
            info!(
                "Failover for {}: {} adopted, {} destroyed, {} lost",
                dead,
                report.count(|o| *o == FailoverOutcome::Adopted),
                report.count(|o| *o == FailoverOutcome::Destroyed),
                report.count(|o| *o == FailoverOutcome::LostRace),
            );
        }
        report
    }

    /// Recover rooms whose owner is gone even though no offline report was seen
    pub async fn sweep_orphans(&self) -> FailoverReport {
        let mut report = FailoverReport::default();
        let orphans = store_call(
            self.config.store_timeout,
            "get_orphaned_rooms",
            self.store.get_orphaned_rooms(self.config.staleness_threshold),
        )
        .await;
        let orphans = match orphans {
            Ok(orphans) => orphans,
            Err(e) => {
                warn!("Orphan sweep failed: {}", e);
                return report;
            }
        };

        for record in orphans {
            if record.owner == self.machine_id {
                continue;
            }
            let room_id = record.room_id.clone();
            let dead = record.owner.clone();
            debug!("Room {} is orphaned (owner {})", room_id, dead);
            let outcome = self.fail_over_room(record, &dead).await;
            report.rooms.push((room_id, outcome));
        }
        report
    }

    /// Delete connections that stopped heartbeating, with their memberships
    pub async fn sweep_expired_connections(&self) -> ChorusResult<usize> {
        let timeout = self.config.store_timeout;
        let expired = store_call(
            timeout,
            "get_expired_connections",
            self.store.get_expired_connections(self.config.staleness_threshold),
        )
        .await?;

        let mut removed = 0;
        for connection in expired {
            let deleted = store_call(
                timeout,
                "delete_connection",
                self.store.delete_connection(&connection.connection_id),
            )
            .await?;
            if deleted {
                debug!("Reaped connection {}", connection.connection_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn fail_over_room(&self, record: RoomRecord, dead: &MachineId) -> FailoverOutcome {
        let room_id = record.room_id.clone();

        if record.destroy_on_orphan {
            return match self.rooms.destroy_room(&room_id).await {
                Ok(_) => {
                    info!("Destroyed orphaned room {}", room_id);
                    FailoverOutcome::Destroyed
                }
                Err(e) => {
                    error!("Could not destroy orphaned room {}: {}", room_id, e);
                    FailoverOutcome::Failed(e.to_string())
                }
            };
        }

        let transferred = store_call(
            self.config.store_timeout,
            "set_room_owner",
            self.store.set_room_owner(&room_id, dead, &self.machine_id),
        )
        .await;
        match transferred {
            Ok(true) => {}
            Ok(false) => {
                warn!("Room {} was adopted by another machine", room_id);
                return FailoverOutcome::LostRace;
            }
            Err(e) => {
                error!("Could not take over room {}: {}", room_id, e);
                return FailoverOutcome::Failed(e.to_string());
            }
        }

        let resource = room_id.resource_key();
        let claimed = self
            .rooms
            .ownership()
            .take_over_ownership(&resource, dead, self.config.claim_poll_interval)
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => warn!("Adopted room {} but {} is claimed elsewhere", room_id, resource),
            Err(e) => warn!("Adopted room {} but could not claim {}: {}", room_id, resource, e),
        }

        // Membership is rebuilt from Pong/Join replies to the bind probe
        let cleared = store_call(
            self.config.store_timeout,
            "clear_room_members",
            self.store.clear_room_members(&room_id),
        )
        .await;
        if let Err(e) = cleared {
            warn!("Could not reset membership of {}: {}", room_id, e);
        }

        let adopted = RoomRecord {
            owner: self.machine_id.clone(),
            ..record
        };
        match self.rooms.bind_room(&adopted).await {
            Ok(()) => {
                info!("Adopted room {} from {}", room_id, dead);
                FailoverOutcome::Adopted
            }
            Err(e) => {
                error!(
                    "Adopted room {} but could not bind it, operator attention required: {}",
                    room_id, e
                );
                FailoverOutcome::AdoptedNotBound(e.to_string())
            }
        }
    }
}

#[async_trait]
impl LeaderCallbacks for RoomFailover {
    async fn on_leader_start(&self, ctx: &LeaderContext) {
        info!("{} sweeping orphaned rooms on taking leadership", ctx.machine_id);
        self.sweep_orphans().await;
    }

    async fn on_leader_tick(&self, _ctx: &LeaderContext) {
        if let Err(e) = self.sweep_expired_connections().await {
            warn!("Connection sweep failed: {}", e);
        }

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % self.config.orphan_sweep_ticks.max(1) == 0 {
            self.sweep_orphans().await;
        }
    }

    async fn on_machine_offline(&self, _ctx: &LeaderContext, machine_id: &MachineId) {
        self.handle_machine_offline(machine_id).await;
    }
}
