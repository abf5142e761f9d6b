//! Distributed coordination core of the chorus session backend
//!
//! - [`lease`]: TTL-bound key sets kept alive by a renewal task
//! - [`ownership`]: claim/release/verify of named resources on a shared hash
//! - [`election`]: per-machine-type leader election with heartbeats
//! - [`rooms`] and [`failover`]: local room binding and orphaned-room recovery
//! - [`server`]: wiring of all of the above into one process

pub mod config;
pub mod election;
pub mod failover;
pub mod lease;
pub mod ownership;
pub mod registry;
pub mod rooms;
pub mod server;

pub use config::{BackendConfig, ChorusServerConfig, LobbyConfig, ServerSection};
pub use election::{
    LeaderCallbacks, LeaderContext, LeaderElection, LeadershipState, NoopCallbacks,
};
pub use failover::{FailoverOutcome, FailoverReport, RoomFailover};
pub use lease::{DistributedHash, ExpiringKeys, Lease};
pub use ownership::OwnershipService;
pub use registry::Registry;
pub use rooms::{LocalRoom, RoomService};
pub use server::{ChorusServer, ChorusServerBuilder};
