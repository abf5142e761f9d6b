//! Redis backend integration tests
//!
//! These need a live Redis 7.4+ server and are ignored by default:
//!
//! ```text
//! CHORUS_REDIS_URL=redis://127.0.0.1:6379 cargo test -p chorus-server-redis -- --ignored
//! ```
//!
//! Every test runs under its own random key prefix so runs never collide.

use chorus_server_redis::{RedisBackend, RedisConfig};
use chorus_shared::{
    ChorusError, ConnectionId, MachineId, MembershipEvent, NewRoom, RoomId, RoomRecord,
    StoreBackend, TopicId,
};
use chorus_util::RngUtils;
use chrono::Utc;
use std::time::Duration;

async fn backend() -> StoreBackend {
    let url = std::env::var("CHORUS_REDIS_URL").expect("CHORUS_REDIS_URL must be set");
    let config = RedisConfig::builder()
        .url(url)
        .key_prefix(format!("chorus-test-{}", RngUtils::random_string()))
        .build();
    RedisBackend::connect(config)
        .await
        .expect("failed to connect to Redis")
}

fn room_owned_by(owner: &MachineId, destroy_on_orphan: bool) -> RoomRecord {
    RoomRecord::new(
        NewRoom::new("test room", "relay").destroy_on_orphan(destroy_on_orphan),
        owner.clone(),
        Utc::now(),
    )
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_machine_lifecycle() {
    let backend = backend().await;
    let id = MachineId::generate("RS");

    let machine = backend.membership.create_machine(&id, "RS").await.unwrap();
    assert_eq!(machine.machine_type, "RS");
    assert!(!machine.leader);

    let duplicate = backend.membership.create_machine(&id, "RS").await;
    assert!(matches!(duplicate, Err(ChorusError::MachineExists { .. })));

    backend.membership.touch_machine(&id).await.unwrap();
    assert!(backend
        .membership
        .is_machine_live(&id, Duration::from_secs(5))
        .await
        .unwrap());

    assert!(backend.membership.delete_machine(&id).await.unwrap());
    assert!(!backend.membership.delete_machine(&id).await.unwrap());
    assert!(matches!(
        backend.membership.touch_machine(&id).await,
        Err(ChorusError::MachineNotFound { .. })
    ));
}

#[tokio::test]
#[ignore]
async fn test_single_leader_per_type() {
    let backend = backend().await;
    let a = MachineId::generate("RS");
    let b = MachineId::generate("RS");
    backend.membership.create_machine(&a, "RS").await.unwrap();
    backend.membership.create_machine(&b, "RS").await.unwrap();

    assert!(backend.membership.try_set_leader(&a, "RS").await.unwrap());
    assert!(!backend.membership.try_set_leader(&b, "RS").await.unwrap());

    let leader = backend
        .membership
        .get_leader_for_type("RS")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leader.id, a);
    assert!(leader.leader);

    // Deleting the leader clears the flag so another machine can take it
    backend.membership.delete_machine(&a).await.unwrap();
    assert!(backend
        .membership
        .get_leader_for_type("RS")
        .await
        .unwrap()
        .is_none());
    assert!(backend.membership.try_set_leader(&b, "RS").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_try_set_leader_requires_row() {
    let backend = backend().await;
    let ghost = MachineId::generate("RS");
    assert!(!backend.membership.try_set_leader(&ghost, "RS").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_membership_events_are_pushed() {
    let backend = backend().await;
    let mut events = backend.membership.subscribe();
    let id = MachineId::generate("RS");

    backend.membership.create_machine(&id, "RS").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within 2s")
        .unwrap();
    assert_eq!(
        event,
        MembershipEvent::MachineCreated {
            machine_id: id,
            machine_type: "RS".into(),
        }
    );
}

// ============================================================================
// Rooms and connections
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_room_owner_compare_and_set() {
    let backend = backend().await;
    let old = MachineId::generate("RS");
    let new = MachineId::generate("RS");
    let room = room_owned_by(&old, false);
    backend.rooms.create_room(&room).await.unwrap();

    assert!(matches!(
        backend.rooms.create_room(&room).await,
        Err(ChorusError::RoomExists { .. })
    ));

    assert!(backend
        .rooms
        .set_room_owner(&room.room_id, &old, &new)
        .await
        .unwrap());
    // Second adopter loses
    assert!(!backend
        .rooms
        .set_room_owner(&room.room_id, &old, &new)
        .await
        .unwrap());

    assert!(backend.rooms.get_rooms_by_machine(&old).await.unwrap().is_empty());
    let owned = backend.rooms.get_rooms_by_machine(&new).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].owner, new);
}

#[tokio::test]
#[ignore]
async fn test_orphaned_rooms_follow_owner_liveness() {
    let backend = backend().await;
    let live = MachineId::generate("RS");
    let gone = MachineId::generate("RS");
    backend.membership.create_machine(&live, "RS").await.unwrap();

    let kept = room_owned_by(&live, false);
    let orphan = room_owned_by(&gone, true);
    backend.rooms.create_room(&kept).await.unwrap();
    backend.rooms.create_room(&orphan).await.unwrap();

    let orphans = backend
        .rooms
        .get_orphaned_rooms(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].room_id, orphan.room_id);
}

#[tokio::test]
#[ignore]
async fn test_membership_cascades() {
    let backend = backend().await;
    let owner = MachineId::generate("RS");
    let room = room_owned_by(&owner, true);
    backend.rooms.create_room(&room).await.unwrap();

    let connection = ConnectionId::generate();
    backend
        .rooms
        .create_connection(&connection, &owner)
        .await
        .unwrap();
    assert!(backend
        .rooms
        .add_room_member(&room.room_id, &connection)
        .await
        .unwrap());
    assert!(!backend
        .rooms
        .add_room_member(&room.room_id, &connection)
        .await
        .unwrap());
    assert!(matches!(
        backend
            .rooms
            .add_room_member(&RoomId::new("missing"), &connection)
            .await,
        Err(ChorusError::RoomNotFound { .. })
    ));

    assert_eq!(
        backend
            .rooms
            .find_machine_for_connection(&connection)
            .await
            .unwrap(),
        Some(owner)
    );

    assert!(backend.rooms.delete_connection(&connection).await.unwrap());
    assert!(backend
        .rooms
        .get_room_members(&room.room_id)
        .await
        .unwrap()
        .is_empty());

    assert!(backend.rooms.delete_room(&room.room_id).await.unwrap());
    assert!(backend.rooms.get_room(&room.room_id).await.unwrap().is_none());
}

// ============================================================================
// Distributed hash and transport
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_hash_field_expiry() {
    let backend = backend().await;
    let fields = vec!["rooms/R1".to_string()];

    assert!(backend.kv.hset_nx("ownership", "rooms/R1", "m1").await.unwrap());
    assert!(!backend.kv.hset_nx("ownership", "rooms/R1", "m2").await.unwrap());
    assert!(!backend
        .kv
        .hdel_if_eq("ownership", "rooms/R1", "m2")
        .await
        .unwrap());

    backend
        .kv
        .hexpire("ownership", &fields, Duration::from_millis(300))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(backend.kv.hget("ownership", "rooms/R1").await.unwrap().is_none());
    assert!(backend.kv.hkeys("ownership").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_topic_fan_out() {
    let backend = backend().await;
    let topic = TopicId::new("room.R1");
    let mut a = backend.transport.subscribe(&topic).await.unwrap();
    let mut b = backend.transport.subscribe(&topic).await.unwrap();

    backend
        .transport
        .publish(&topic, b"hello".to_vec())
        .await
        .unwrap();

    assert_eq!(a.recv().await.unwrap(), b"hello");
    assert_eq!(b.recv().await.unwrap(), b"hello");

    backend.transport.delete_topic(&topic).await.unwrap();
    assert!(a.recv().await.is_none());
}
