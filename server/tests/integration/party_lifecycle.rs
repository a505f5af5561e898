// party_sync/server/tests/integration/party_lifecycle.rs

use party_sync_core::cache::message::{Notification, PartyNotification};
use party_sync_core::cache::snapshot::Snapshot;
use party_sync_core::cache::{Cache, Keyspace, MemoryCache, MessageHandler};
use party_sync_core::core::config::{CacheType, PartyConfig, TaskPoolConfig};
use party_sync_core::core::error::{PartyError, PartyResult};
use party_sync_core::core::types::{PartyId, PartyRole, PlayerId};
use party_sync_core::entities::{PartyPlayer, Promotion};
use party_sync_core::network::presence::{LocalPresence, PresenceEvent};
use party_sync_core::server::instance::PartySyncService;
use party_sync_core::server::processor::Reaction;

use crossbeam::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

struct Node {
    service: Arc<PartySyncService>,
    presence: Arc<LocalPresence>,
    cache: Arc<MemoryCache>,
}

fn test_config() -> PartyConfig {
    PartyConfig {
        new_party_invite_delay_ms: 0,
        disconnect_grace_ms: 0,
        task_pools: TaskPoolConfig { io_threads: 1, message_threads: 1 },
        ..PartyConfig::default()
    }
}

fn setup_node() -> Node {
    info!("[Test Setup] Building standalone party node...");
    let cache = Arc::new(MemoryCache::new());
    let presence = Arc::new(LocalPresence::new());
    let service = PartySyncService::with_cache(test_config(), cache.clone(), presence.clone())
        .expect("Failed to build party service");
    Node { service: Arc::new(service), presence, cache }
}

fn connect(node: &Node, name: &str) -> PlayerId {
    let id = Uuid::new_v4();
    node.presence.mark_online(id, name);
    node.service.player_connected(id, name);
    id
}

fn stored_player(node: &Node, id: &PlayerId) -> Option<PartyPlayer> {
    node.cache
        .get(&Keyspace::default().player_key(id))
        .expect("memory backend never fails")
        .map(|snapshot| PartyPlayer::from_snapshot(&snapshot).expect("stored player decodes"))
}

/// Blocks until every job already queued on the I/O pool has run.
fn settle_io(node: &Node) {
    let (tx, rx) = channel::bounded(1);
    node.service.context().tasks.submit_io("test-barrier", move || {
        tx.send(()).ok();
        Ok(())
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("I/O pool stalled");
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn create_invite_accept_builds_expected_party() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let member = connect(&node, "Member");

    let party = node.service.create_party(leader).unwrap();
    assert_eq!(party.len(), 1);
    assert_eq!(party.player(&leader).unwrap().role(), PartyRole::Leader);

    node.service.invite(leader, member).unwrap();
    let party = node.service.accept_invite(member, leader).unwrap();

    assert_eq!(party.player(&leader).unwrap().role(), PartyRole::Leader);
    assert_eq!(party.player(&member).unwrap().role(), PartyRole::Member);
    assert_eq!(party.invites().count(), 0);

    let stored = node
        .cache
        .get(&Keyspace::default().party_key(party.id()))
        .unwrap()
        .expect("party persisted");
    assert_eq!(stored, party.to_snapshot());
    assert_eq!(stored_player(&node, &member).unwrap().role(), PartyRole::Member);
    assert_eq!(node.service.player(&member).unwrap().role(), PartyRole::Member);
}

#[test]
fn invite_without_party_creates_one() {
    let node = setup_node();
    let a = connect(&node, "A");
    let b = connect(&node, "B");

    let party = node.service.invite(a, b).unwrap();
    assert_eq!(party.leader().unwrap().id(), a);
    assert!(party.has_invite(&b));
    assert_eq!(node.service.party_of_player(&a).unwrap().id(), party.id());

    // the invite notice goes out over the network channel and comes back to us
    wait_until("invite notice", || node.presence.pending_events() > 0);
    match node.presence.pop_event() {
        Some(PresenceEvent::Message { player_id, text }) => {
            assert_eq!(player_id, b);
            assert!(text.contains("A"));
        }
        other => panic!("unexpected presence event {:?}", other),
    }
}

#[test]
fn inviting_someone_already_in_a_party_is_refused() {
    let node = setup_node();
    let a = connect(&node, "A");
    let b = connect(&node, "B");
    let c = connect(&node, "C");
    node.service.create_party(c).unwrap();

    assert!(matches!(node.service.invite(a, c), Err(PartyError::NotPermitted(_))));
    assert!(matches!(node.service.invite(a, Uuid::new_v4()), Err(PartyError::NotFound(_))));
    node.service.invite(a, b).unwrap();
}

#[test]
fn promote_member_then_moderator() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let m1 = connect(&node, "M1");
    let m2 = connect(&node, "M2");
    for m in [m1, m2] {
        node.service.invite(leader, m).unwrap();
        node.service.accept_invite(m, leader).unwrap();
    }

    assert_eq!(node.service.promote(leader, m1).unwrap(), Promotion::ToModerator);
    let party = node.service.party_of_player(&leader).unwrap();
    assert_eq!(party.player(&m1).unwrap().role(), PartyRole::Moderator);
    assert_eq!(party.leader().unwrap().id(), leader);

    // a second moderator may coexist with the first
    assert_eq!(node.service.promote(leader, m2).unwrap(), Promotion::ToModerator);

    assert_eq!(node.service.promote(leader, m1).unwrap(), Promotion::LeadershipSwapped);
    let party = node.service.party_of_player(&leader).unwrap();
    assert_eq!(party.player(&m1).unwrap().role(), PartyRole::Leader);
    assert_eq!(party.player(&leader).unwrap().role(), PartyRole::Moderator);
    assert_eq!(party.players().filter(|p| p.role() == PartyRole::Leader).count(), 1);

    assert_eq!(stored_player(&node, &m1).unwrap().role(), PartyRole::Leader);
    assert_eq!(node.service.player(&leader).unwrap().role(), PartyRole::Moderator);

    // only the leader may promote now
    assert!(matches!(node.service.promote(leader, m2), Err(PartyError::NotPermitted(_))));
}

#[test]
fn transfer_swaps_leadership_regardless_of_role() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let member = connect(&node, "Member");
    node.service.invite(leader, member).unwrap();
    node.service.accept_invite(member, leader).unwrap();

    node.service.transfer(leader, member).unwrap();
    let party = node.service.party_of_player(&member).unwrap();
    assert_eq!(party.leader().unwrap().id(), member);
    assert_eq!(party.player(&leader).unwrap().role(), PartyRole::Moderator);
    assert!(node.service.transfer(leader, member).is_err());
}

#[test]
fn disband_resets_roles_and_deletes_snapshot() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let members: Vec<PlayerId> = (0..3).map(|i| connect(&node, &format!("M{}", i))).collect();
    for m in &members {
        node.service.invite(leader, *m).unwrap();
        node.service.accept_invite(*m, leader).unwrap();
    }
    let party_id = node.service.party_of_player(&leader).unwrap().id().clone();

    let former = node.service.disband(leader).unwrap();
    assert_eq!(former.len(), 4);
    assert!(former.iter().all(|p| p.role() == PartyRole::None));

    assert!(node.cache.get(&Keyspace::default().party_key(&party_id)).unwrap().is_none());
    for id in members.iter().chain(std::iter::once(&leader)) {
        assert_eq!(stored_player(&node, id).unwrap().role(), PartyRole::None);
        assert_eq!(node.service.player(id).unwrap().role(), PartyRole::None);
        assert!(node.service.party_of_player(id).is_none());
    }
}

#[test]
fn leader_leaving_disbands() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let member = connect(&node, "Member");
    node.service.invite(leader, member).unwrap();
    let party = node.service.accept_invite(member, leader).unwrap();

    node.service.leave(leader).unwrap();
    assert!(node.service.party_by_id(party.id()).is_none());
    assert!(node.cache.get(&Keyspace::default().party_key(party.id())).unwrap().is_none());
    assert_eq!(node.service.player(&member).unwrap().role(), PartyRole::None);
}

#[test]
fn sole_leader_disconnect_disbands_party() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let party = node.service.create_party(leader).unwrap();

    node.presence.mark_offline(&leader);
    node.service.player_disconnected(leader).unwrap();

    assert!(node.service.party_by_id(party.id()).is_none());
    assert!(node.cache.get(&Keyspace::default().party_key(party.id())).unwrap().is_none());

    // standalone: after the grace delay the player is gone everywhere
    settle_io(&node);
    assert!(node.service.player(&leader).is_none());
    assert!(stored_player(&node, &leader).is_none());
}

#[test]
fn reconnect_within_grace_keeps_index_entry() {
    let node = setup_node();
    let id = connect(&node, "Flaky");
    // offline only long enough to run the disconnect flow
    node.service.player_disconnected(id).unwrap();
    settle_io(&node);
    assert!(node.service.player(&id).is_some());
}

#[test]
fn left_network_member_is_removed_and_announced() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let member = connect(&node, "Member");
    node.service.invite(leader, member).unwrap();
    let party = node.service.accept_invite(member, leader).unwrap();

    node.presence.mark_offline(&member);
    node.service.player_left_network(member).unwrap();

    let stored = node.cache.get(&Keyspace::default().party_key(party.id())).unwrap().unwrap();
    let stored = party_sync_core::entities::Party::from_snapshot(&stored).unwrap();
    assert_eq!(stored.player_ids(), vec![leader]);
    assert!(stored_player(&node, &member).is_none());
    assert!(node.service.player(&member).is_none());
    assert_eq!(node.service.party_by_id(party.id()).unwrap().player_ids(), vec![leader]);
}

#[test]
fn party_message_reaches_online_members() {
    let node = setup_node();
    let leader = connect(&node, "Leader");
    let member = connect(&node, "Member");
    node.service.invite(leader, member).unwrap();
    let party = node.service.accept_invite(member, leader).unwrap();
    while node.presence.pop_event().is_some() {}

    node.service.send_party_message(party.id(), "gg").unwrap();
    let mut recipients: Vec<PlayerId> = Vec::new();
    wait_until("party message", || {
        while let Some(event) = node.presence.pop_event() {
            if let PresenceEvent::Message { player_id, text } = event {
                if text == "gg" {
                    recipients.push(player_id);
                }
            }
        }
        recipients.len() >= 2
    });
    recipients.sort();
    let mut expected = vec![leader, member];
    expected.sort();
    assert_eq!(recipients, expected);
}

#[test]
fn invite_delay_does_not_hold_up_notifications() {
    let cache = Arc::new(MemoryCache::new());
    let presence = Arc::new(LocalPresence::new());
    let config = PartyConfig {
        new_party_invite_delay_ms: 800,
        ..test_config()
    };
    let service = PartySyncService::with_cache(config, cache.clone(), presence.clone()).unwrap();
    let node = Node { service: Arc::new(service), presence, cache };
    let a = connect(&node, "A");
    let b = connect(&node, "B");
    let c = connect(&node, "C");
    let tracked = node.service.create_party(c).unwrap();

    let inviting = {
        let service = node.service.clone();
        std::thread::spawn(move || service.invite(a, b))
    };
    // the invite flow created a's party and is now waiting out the delay
    wait_until("fresh party stored", || {
        node.service
            .party_of_player(&a)
            .map(|party| node.cache.get(&Keyspace::default().party_key(party.id())).unwrap().is_some())
            .unwrap_or(false)
    });
    let fresh = node.service.party_of_player(&a).unwrap();

    let started = Instant::now();
    let processor = node.service.processor();
    let update = |party_id: PartyId| Notification::from(PartyNotification::Update { party_id });
    assert_eq!(processor.handle(&update("unrelated1".parse().unwrap())).unwrap(), Reaction::Ignored);
    assert_eq!(processor.handle(&update(tracked.id().clone())).unwrap(), Reaction::MirrorUpdated);
    assert_eq!(processor.handle(&update(fresh.id().clone())).unwrap(), Reaction::MirrorUpdated);
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "notifications waited {:?}",
        started.elapsed()
    );

    let invited = inviting.join().unwrap().unwrap();
    assert!(invited.has_invite(&b));
}

#[test]
fn dropping_the_service_releases_the_backend() {
    let cache = Arc::new(MemoryCache::new());
    let watch = Arc::downgrade(&cache);
    let presence = Arc::new(LocalPresence::new());
    let service = PartySyncService::with_cache(test_config(), cache.clone(), presence.clone()).unwrap();
    let id = Uuid::new_v4();
    presence.mark_online(id, "Leaving");
    service.player_connected(id, "Leaving");
    service.create_party(id).unwrap();

    drop(service);
    drop(cache);
    // queued message jobs may still hold the service's state for a moment
    wait_until("backend released", || watch.upgrade().is_none());
}

/// A backend that is never reachable.
struct DownCache;

impl Cache for DownCache {
    fn get(&self, _key: &str) -> PartyResult<Option<Snapshot>> {
        Err(PartyError::BackendUnavailable("down".into()))
    }
    fn set(&self, _key: &str, _snapshot: &Snapshot) -> PartyResult<()> {
        Err(PartyError::BackendUnavailable("down".into()))
    }
    fn delete(&self, _key: &str) -> PartyResult<()> {
        Err(PartyError::BackendUnavailable("down".into()))
    }
    fn scan(&self, _prefix: &str) -> PartyResult<Vec<Snapshot>> {
        Err(PartyError::BackendUnavailable("down".into()))
    }
    fn publish(&self, _channel: &str, _message: &str) -> PartyResult<()> {
        Err(PartyError::BackendUnavailable("down".into()))
    }
    fn subscribe(&self, _handler: Arc<dyn MessageHandler>) -> PartyResult<()> {
        Ok(())
    }
    fn cache_type(&self) -> CacheType {
        CacheType::Redis
    }
}

#[test]
fn unreachable_backend_degrades_to_local_and_surfaces_failed_persist() {
    let presence = Arc::new(LocalPresence::new());
    let service = PartySyncService::with_cache(test_config(), Arc::new(DownCache), presence.clone()).unwrap();
    let id = Uuid::new_v4();
    presence.mark_online(id, "Alone");

    let player = service.player_connected(id, "Alone");
    assert_eq!(player.role(), PartyRole::None);
    assert!(service.player(&id).is_some());

    let err = service.create_party(id).unwrap_err();
    assert!(err.is_backend_unavailable());
    // local state moved; the write can be retried later
    let party = service.party_of_player(&id).expect("party kept locally");
    assert!(service.resync_party(party.id()).unwrap_err().is_backend_unavailable());

    // and remote enumeration never pretends the network is empty
    assert!(service.remote_parties().unwrap_err().is_backend_unavailable());
}
