// party_sync/server/tests/integration/cross_server_sync.rs
//
// Two services on one shared MemoryCache behave like two game servers on one
// Redis: every publish reaches both processors, the publisher included.

use party_sync_core::cache::message::{NetworkNotification, Notification, PartyNotification};
use party_sync_core::cache::snapshot::Snapshot;
use party_sync_core::cache::{Cache, Keyspace, MemoryCache, MessageHandler};
use party_sync_core::core::config::{CacheType, PartyConfig, TaskPoolConfig};
use party_sync_core::core::error::PartyResult;
use party_sync_core::core::types::{PartyRole, PlayerId};
use party_sync_core::entities::{Party, PartyPlayer};
use party_sync_core::network::presence::{LocalPresence, PresenceEvent};
use party_sync_core::server::instance::PartySyncService;
use party_sync_core::server::processor::Reaction;

use crossbeam::channel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Passes everything through and counts reads.
struct CountingCache {
    inner: Arc<MemoryCache>,
    gets: AtomicUsize,
    scans: AtomicUsize,
}

impl CountingCache {
    fn new(inner: Arc<MemoryCache>) -> Self {
        CountingCache { inner, gets: AtomicUsize::new(0), scans: AtomicUsize::new(0) }
    }

    fn reads(&self) -> usize {
        self.gets.load(Ordering::SeqCst) + self.scans.load(Ordering::SeqCst)
    }
}

impl Cache for CountingCache {
    fn get(&self, key: &str) -> PartyResult<Option<Snapshot>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }
    fn set(&self, key: &str, snapshot: &Snapshot) -> PartyResult<()> {
        self.inner.set(key, snapshot)
    }
    fn delete(&self, key: &str) -> PartyResult<()> {
        self.inner.delete(key)
    }
    fn scan(&self, prefix: &str) -> PartyResult<Vec<Snapshot>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.scan(prefix)
    }
    fn publish(&self, channel: &str, message: &str) -> PartyResult<()> {
        self.inner.publish(channel, message)
    }
    fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> PartyResult<()> {
        self.inner.subscribe(handler)
    }
    fn cache_type(&self) -> CacheType {
        self.inner.cache_type()
    }
}

struct Server {
    service: Arc<PartySyncService>,
    presence: Arc<LocalPresence>,
}

fn shared_config() -> PartyConfig {
    PartyConfig {
        standalone: false,
        new_party_invite_delay_ms: 0,
        disconnect_grace_ms: 0,
        task_pools: TaskPoolConfig { io_threads: 1, message_threads: 1 },
        ..PartyConfig::default()
    }
}

fn start_server(cache: Arc<dyn Cache>) -> Server {
    let presence = Arc::new(LocalPresence::new());
    let service = PartySyncService::with_cache(shared_config(), cache, presence.clone())
        .expect("Failed to build party service");
    Server { service: Arc::new(service), presence }
}

fn connect(server: &Server, name: &str) -> PlayerId {
    let id = Uuid::new_v4();
    join_existing(server, id, name);
    id
}

fn join_existing(server: &Server, id: PlayerId, name: &str) {
    server.presence.mark_online(id, name);
    server.service.player_connected(id, name);
}

/// Blocks until every notification already queued on the server's message
/// pool has been handled.
fn settle_messages(server: &Server) {
    let (tx, rx) = channel::bounded(1);
    server.service.context().tasks.submit_message(move || {
        tx.send(()).ok();
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("message pool stalled");
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn accepted_invite_propagates_to_inviters_server() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let beta = start_server(backend.clone());

    let leader = connect(&alpha, "Leader");
    let guest = connect(&beta, "Guest");

    let party = alpha.service.invite(leader, guest).unwrap();
    let joined = beta.service.accept_invite(guest, leader).unwrap();
    assert_eq!(joined.id(), party.id());
    assert_eq!(beta.service.party_of_player(&guest).unwrap().len(), 2);

    wait_until("alpha mirror sees the guest", || {
        alpha
            .service
            .party_by_id(party.id())
            .map(|p| p.has_player(&guest) && !p.has_invite(&guest))
            .unwrap_or(false)
    });
}

#[test]
fn promotion_reaches_the_other_server() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let beta = start_server(backend.clone());

    let leader = connect(&alpha, "Leader");
    let guest = connect(&beta, "Guest");
    alpha.service.invite(leader, guest).unwrap();
    let party = beta.service.accept_invite(guest, leader).unwrap();
    wait_until("alpha mirror", || {
        alpha.service.party_by_id(party.id()).map(|p| p.len() == 2).unwrap_or(false)
    });

    alpha.service.promote(leader, guest).unwrap();
    wait_until("beta sees the moderator", || {
        let mirrored = beta
            .service
            .party_by_id(party.id())
            .and_then(|p| p.player(&guest).map(PartyPlayer::role));
        let indexed = beta.service.player(&guest).map(|p| p.role());
        mirrored == Some(PartyRole::Moderator) && indexed == Some(PartyRole::Moderator)
    });
}

#[test]
fn update_without_mirror_never_fetches() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let counting = Arc::new(CountingCache::new(backend.clone()));
    let beta = start_server(counting.clone());

    let leader = connect(&alpha, "Leader");
    let party = alpha.service.create_party(leader).unwrap();
    let baseline = counting.reads();

    alpha.service.resync_party(party.id()).unwrap();
    settle_messages(&beta);
    assert_eq!(counting.reads(), baseline, "beta read the backend for a party it does not track");

    let update: Notification = PartyNotification::Update { party_id: party.id().clone() }.into();
    assert_eq!(beta.service.processor().handle(&update).unwrap(), Reaction::Ignored);
    assert_eq!(counting.reads(), baseline);
    assert!(beta.service.party_by_id(party.id()).is_none());
}

#[test]
fn repeated_update_is_idempotent() {
    let backend = Arc::new(MemoryCache::new());
    let beta = start_server(backend.clone());

    let mut party = Party::new(
        "idem123".parse().unwrap(),
        PartyPlayer::new(Uuid::new_v4(), "Remote", PartyRole::None, Some("&7".into())),
    );
    party.add_invite(Uuid::new_v4());
    party.silent_update_now(beta.service.context()).unwrap();
    beta.service.manager().cache_party(party.clone());

    let update: Notification = PartyNotification::Update { party_id: party.id().clone() }.into();
    beta.service.processor().handle(&update).unwrap();
    let first = beta.service.party_by_id(party.id()).unwrap();
    beta.service.processor().handle(&update).unwrap();
    let second = beta.service.party_by_id(party.id()).unwrap();

    assert_eq!(first, party);
    assert_eq!(second, first);
}

#[test]
fn mirror_tracks_last_value_read() {
    let backend = Arc::new(MemoryCache::new());
    let beta = start_server(backend.clone());
    let ctx = beta.service.context().clone();

    let base = Party::new(
        "order77".parse().unwrap(),
        PartyPlayer::new(Uuid::new_v4(), "Remote", PartyRole::None, None),
    );
    beta.service.manager().cache_party(base.clone());

    let mut u1 = base.clone();
    u1.add_invite(Uuid::new_v4());
    let mut u2 = base.clone();
    u2.add_player(PartyPlayer::new(Uuid::new_v4(), "Late", PartyRole::None, None), PartyRole::Member);

    // U1 is written and announced, but U2's write lands before U1's read
    u1.silent_update_now(&ctx).unwrap();
    u2.silent_update_now(&ctx).unwrap();

    let update: Notification = PartyNotification::Update { party_id: base.id().clone() }.into();
    beta.service.processor().handle(&update).unwrap();
    assert_eq!(beta.service.party_by_id(base.id()).unwrap(), u2);
    beta.service.processor().handle(&update).unwrap();
    assert_eq!(beta.service.party_by_id(base.id()).unwrap(), u2);
}

#[test]
fn disband_on_one_server_drops_mirror_on_the_other() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let beta = start_server(backend.clone());

    let leader = connect(&alpha, "Leader");
    let guest = connect(&beta, "Guest");
    alpha.service.invite(leader, guest).unwrap();
    let party = beta.service.accept_invite(guest, leader).unwrap();

    alpha.service.disband(leader).unwrap();
    wait_until("beta drops the mirror and resets the guest", || {
        beta.service.party_by_id(party.id()).is_none()
            && beta.service.player(&guest).map(|p| p.role()) == Some(PartyRole::None)
    });
    assert!(backend.get(&Keyspace::default().party_key(party.id())).unwrap().is_none());
}

#[test]
fn connect_request_reaches_only_the_hosting_server() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let beta = start_server(backend.clone());
    let guest = connect(&beta, "Guest");

    alpha.service.send_to_server(&[guest], "minigames-1").unwrap();
    wait_until("transfer request", || beta.presence.pending_events() > 0);
    assert_eq!(
        beta.presence.pop_event(),
        Some(PresenceEvent::Transfer { player_id: guest, server: "minigames-1".into() })
    );
    settle_messages(&alpha);
    assert_eq!(alpha.presence.pending_events(), 0);

    let stray: Notification = NetworkNotification::Connect { players: vec![Uuid::new_v4()], server: "x".into() }.into();
    assert_eq!(alpha.service.processor().handle(&stray).unwrap(), Reaction::Ignored);
}

#[test]
fn returning_player_restores_role_and_mirror() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let beta = start_server(backend.clone());

    let leader = connect(&alpha, "Leader");
    let guest = connect(&beta, "Guest");
    alpha.service.invite(leader, guest).unwrap();
    let party = beta.service.accept_invite(guest, leader).unwrap();

    // the guest switches from beta to alpha
    beta.presence.mark_offline(&guest);
    beta.service.player_disconnected(guest).unwrap();
    assert!(beta.service.party_by_id(party.id()).is_none(), "last local member releases the mirror");

    join_existing(&alpha, guest, "Guest");
    assert_eq!(alpha.service.player(&guest).unwrap().role(), PartyRole::Member);
    assert!(alpha.service.party_by_id(party.id()).unwrap().has_player(&guest));

    // shared mode keeps the stored player across the switch
    let stored = backend.get(&Keyspace::default().player_key(&guest)).unwrap().unwrap();
    assert_eq!(PartyPlayer::from_snapshot(&stored).unwrap().role(), PartyRole::Member);
}

#[test]
fn proxy_departure_removes_member_everywhere() {
    let backend = Arc::new(MemoryCache::new());
    let alpha = start_server(backend.clone());
    let beta = start_server(backend.clone());
    let proxy = start_server(backend.clone());

    let leader = connect(&alpha, "Leader");
    let guest = connect(&beta, "Guest");
    alpha.service.invite(leader, guest).unwrap();
    let party = beta.service.accept_invite(guest, leader).unwrap();

    beta.presence.mark_offline(&guest);
    proxy.service.player_left_network(guest).unwrap();

    wait_until("alpha mirror loses the guest", || {
        alpha
            .service
            .party_by_id(party.id())
            .map(|p| p.player_ids() == vec![leader])
            .unwrap_or(false)
    });
    assert!(backend.get(&Keyspace::default().player_key(&guest)).unwrap().is_none());
    assert!(proxy.service.party_by_id(party.id()).is_none());
}
