use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
    cache::PeerCache,
    collab::{IdentityService, LifecycleBinder, TorrentRegistry, TrackerService},
    peer::{AnnounceKey, Peer},
    source::{tracker_peer_source, PeerSource, PeerSourceFactory},
    InfoHash,
};

/// A callback invoked with every new peer discovered for a torrent. Dispatch
/// to these is isolated with `catch_unwind`: a panicking subscriber cannot
/// bring the discovery loop down.
pub type PeerConsumer = Box<dyn Fn(Peer) + Send + Sync>;

/// Fixed, mandatory construction parameters for a [`PeerRegistry`] — no
/// partial/builder defaults, per the ambient configuration conventions this
/// core follows.
#[derive(Clone)]
pub struct PeerRegistryConfig {
    pub local_peer_address: IpAddr,
    pub local_peer_port: u16,
    pub peer_discovery_interval: Duration,
    pub tracker_query_interval: Duration,
    pub extra_peer_source_factories: Vec<Arc<dyn PeerSourceFactory>>,
}

struct Shared {
    cache: PeerCache,
    torrent_registry: Arc<dyn TorrentRegistry>,
    tracker_service: Arc<dyn TrackerService>,
    subscribers: Mutex<HashMap<InfoHash, Vec<PeerConsumer>>>,
    extra_announce_keys: Mutex<HashMap<InfoHash, HashSet<AnnounceKey>>>,
    local_peer: Peer,
    config: PeerRegistryConfig,
}

impl Shared {
    /// A peer echoing our own wildcard-bound address back at us never enters
    /// the cache and is never dispatched to subscribers — checked before
    /// interning, not filtered out downstream.
    fn add_peer(&self, torrent_id: InfoHash, peer: Peer) {
        if is_local_peer(&self.local_peer, &peer) {
            return;
        }

        let cached = self.cache.register(peer);

        let subscribers = self.subscribers.lock().unwrap();
        if let Some(consumers) = subscribers.get(&torrent_id) {
            for consumer in consumers {
                let peer = Peer {
                    address: cached.address,
                    peer_id: cached.peer_id,
                    options: cached.options(),
                };
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| consumer(peer))) {
                    tracing::error!(?panic, "peer consumer panicked");
                }
            }
        }
    }
}

/// Coordinates peer discovery across every active torrent: a periodic
/// scheduler sweeps each one, queries its tracker (and any extra peer
/// sources, e.g. PEX or DHT) and interns every peer found into a shared,
/// address-keyed cache before fanning it out to subscribers.
pub struct PeerRegistry {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl PeerRegistry {
    /// Builds a registry and binds its discovery loop to `lifecycle`'s
    /// startup/shutdown hooks, so the embedding client controls when
    /// discovery actually starts without this type needing a runtime handle
    /// of its own.
    pub fn new(
        config: PeerRegistryConfig,
        torrent_registry: Arc<dyn TorrentRegistry>,
        tracker_service: Arc<dyn TrackerService>,
        identity: Arc<dyn IdentityService>,
        lifecycle: &mut dyn LifecycleBinder,
    ) -> Arc<Self> {
        let local_peer = Peer::with_id(
            std::net::SocketAddr::new(config.local_peer_address, config.local_peer_port),
            identity.local_peer_id(),
        );

        let shared = Arc::new(Shared {
            cache: PeerCache::new(),
            torrent_registry,
            tracker_service,
            subscribers: Mutex::new(HashMap::new()),
            extra_announce_keys: Mutex::new(HashMap::new()),
            local_peer,
            config,
        });

        let registry = Arc::new(Self {
            shared: shared.clone(),
            scheduler: Mutex::new(None),
        });

        let startup_shared = shared.clone();
        let startup_scheduler = Arc::downgrade(&registry);
        lifecycle.on_startup(Box::new(move || {
            let handle = tokio::spawn(discovery_loop(startup_shared));
            if let Some(registry) = startup_scheduler.upgrade() {
                *registry.scheduler.lock().unwrap() = Some(handle);
            }
        }));

        let shutdown_scheduler = Arc::downgrade(&registry);
        lifecycle.on_shutdown(Box::new(move || {
            if let Some(registry) = shutdown_scheduler.upgrade() {
                if let Some(handle) = registry.scheduler.lock().unwrap().take() {
                    handle.abort();
                }
            }
        }));

        registry
    }

    pub fn local_peer(&self) -> Peer {
        self.shared.local_peer.clone()
    }

    /// Returns the cached identity for `address`, interning a minimal entry
    /// (no peer-id, no options) if none exists yet.
    pub fn get_peer_for_address(&self, address: std::net::SocketAddr) -> Peer {
        let cached = self.shared.cache.lookup(address);
        Peer {
            address: cached.address,
            peer_id: cached.peer_id,
            options: cached.options(),
        }
    }

    /// Manually feed a peer into the registry — e.g. one learned from an
    /// incoming connection's handshake, outside the discovery loop.
    pub fn add_peer(&self, torrent_id: InfoHash, peer: Peer) {
        self.shared.add_peer(torrent_id, peer);
    }

    pub fn add_peer_consumer(&self, torrent_id: InfoHash, consumer: PeerConsumer) {
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .entry(torrent_id)
            .or_default()
            .push(consumer);
    }

    /// Drops every subscriber for `torrent_id`. Does not touch the peer
    /// cache, which is shared across torrents.
    // TODO: someone should call this after a torrent is stopped/completed.
    pub fn remove_peer_consumers(&self, torrent_id: InfoHash) {
        self.shared.subscribers.lock().unwrap().remove(&torrent_id);
    }

    /// Registers an additional announce key (e.g. a second tracker learned
    /// out-of-band) to be swept alongside a torrent's primary one.
    pub fn add_peer_source(&self, torrent_id: InfoHash, key: AnnounceKey) {
        self.shared
            .extra_announce_keys
            .lock()
            .unwrap()
            .entry(torrent_id)
            .or_default()
            .insert(key);
    }
}

fn is_local_peer(local: &Peer, candidate: &Peer) -> bool {
    candidate.address.ip().is_unspecified() && candidate.address.port() == local.address.port()
}

#[tracing::instrument(skip_all, name = "peer-collector")]
async fn discovery_loop(shared: Arc<Shared>) {
    let start = tokio::time::Instant::now() + Duration::from_millis(1);
    let mut ticker = tokio::time::interval_at(start, shared.config.peer_discovery_interval);

    loop {
        ticker.tick().await;
        sweep(&shared).await;
    }
}

/// One discovery pass over every torrent with at least one subscriber.
/// Torrents nobody is listening for are skipped entirely — there is no point
/// announcing for a swarm no worker will ever hear about.
async fn sweep(shared: &Arc<Shared>) {
    let torrent_ids: Vec<InfoHash> = {
        let subscribers = shared.subscribers.lock().unwrap();
        subscribers
            .iter()
            .filter(|(_, consumers)| !consumers.is_empty())
            .map(|(id, _)| *id)
            .collect()
    };

    for torrent_id in torrent_ids {
        let Some(descriptor) = shared.torrent_registry.get_descriptor(torrent_id) else {
            continue;
        };
        if !descriptor.is_active {
            continue;
        }
        let Some(meta) = shared.torrent_registry.get_torrent(torrent_id) else {
            continue;
        };

        let mut sources: Vec<Box<dyn PeerSource>> = Vec::new();

        if let Some(key) = &meta.announce_key {
            if let Some(source) = tracker_peer_source(
                shared.tracker_service.as_ref(),
                key,
                shared.config.tracker_query_interval,
            ) {
                sources.push(Box::new(source));
            }
        }

        // BEP-27: a private torrent must only ever learn peers from its own
        // tracker(s) — no PEX, no DHT, no extra announce keys.
        if !meta.is_private {
            let extra_keys: Vec<AnnounceKey> = shared
                .extra_announce_keys
                .lock()
                .unwrap()
                .get(&torrent_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();
            for key in extra_keys {
                if let Some(source) = tracker_peer_source(
                    shared.tracker_service.as_ref(),
                    &key,
                    shared.config.tracker_query_interval,
                ) {
                    sources.push(Box::new(source));
                }
            }
            for factory in &shared.config.extra_peer_source_factories {
                sources.push(factory.peer_source(torrent_id));
            }
        }

        for mut source in sources {
            query(shared, torrent_id, source.as_mut()).await;
        }
    }
}

async fn query(shared: &Arc<Shared>, torrent_id: InfoHash, source: &mut dyn PeerSource) {
    match source.update().await {
        Ok(true) => {
            for peer in source.peers() {
                shared.add_peer(torrent_id, peer);
            }
        }
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(?torrent_id, error = %err, "peer source query failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{TrackerClient, TrackerQueryError};
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    struct FakeLifecycle {
        startup: Vec<Box<dyn FnOnce() + Send>>,
    }

    impl FakeLifecycle {
        fn new() -> Self {
            Self { startup: Vec::new() }
        }

        fn run_startup(self) {
            for hook in self.startup {
                hook();
            }
        }
    }

    impl LifecycleBinder for FakeLifecycle {
        fn on_startup(&mut self, hook: Box<dyn FnOnce() + Send>) {
            self.startup.push(hook);
        }
        fn on_shutdown(&mut self, _hook: Box<dyn FnOnce() + Send>) {}
    }

    struct FakeIdentity;
    impl IdentityService for FakeIdentity {
        fn local_peer_id(&self) -> [u8; 20] {
            [1u8; 20]
        }
    }

    struct FakeTorrentRegistry {
        torrents: HashMap<InfoHash, (crate::collab::TorrentDescriptor, crate::collab::TorrentMeta)>,
    }

    impl TorrentRegistry for FakeTorrentRegistry {
        fn get_descriptor(&self, id: InfoHash) -> Option<crate::collab::TorrentDescriptor> {
            self.torrents.get(&id).map(|(d, _)| *d)
        }
        fn get_torrent(&self, id: InfoHash) -> Option<crate::collab::TorrentMeta> {
            self.torrents.get(&id).map(|(_, m)| m.clone())
        }
    }

    struct FakeTrackerService {
        calls: Arc<AtomicUsize>,
        peer_port: u16,
    }

    impl TrackerService for FakeTrackerService {
        fn is_supported_protocol(&self, _url: &url::Url) -> bool {
            true
        }
        fn make_client(&self, _key: &AnnounceKey) -> Box<dyn TrackerClient> {
            Box::new(FakeTrackerClient {
                calls: self.calls.clone(),
                peer_port: self.peer_port,
            })
        }
    }

    struct FakeTrackerClient {
        calls: Arc<AtomicUsize>,
        peer_port: u16,
    }

    #[async_trait]
    impl TrackerClient for FakeTrackerClient {
        async fn announce(&mut self) -> Result<Vec<Peer>, TrackerQueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Peer::new(addr(self.peer_port))])
        }
    }

    fn base_config() -> PeerRegistryConfig {
        PeerRegistryConfig {
            local_peer_address: Ipv4Addr::new(127, 0, 0, 1).into(),
            local_peer_port: 6881,
            peer_discovery_interval: Duration::from_millis(20),
            tracker_query_interval: Duration::from_secs(0),
            extra_peer_source_factories: Vec::new(),
        }
    }

    fn torrent_id(byte: u8) -> InfoHash {
        [byte; 20]
    }

    // Scenario 1: a subscribed, active torrent fans a tracker-discovered peer
    // out to its consumer.
    #[tokio::test]
    async fn discovery_fans_out_to_subscribers() {
        let id = torrent_id(1);
        let mut torrents = HashMap::new();
        torrents.insert(
            id,
            (
                crate::collab::TorrentDescriptor { is_active: true },
                crate::collab::TorrentMeta {
                    announce_key: Some(AnnounceKey::Single("http://tr/a".parse().unwrap())),
                    is_private: false,
                },
            ),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let tracker_service = Arc::new(FakeTrackerService {
            calls: calls.clone(),
            peer_port: 9001,
        });
        let torrent_registry = Arc::new(FakeTorrentRegistry { torrents });
        let mut lifecycle = FakeLifecycle::new();

        let registry = PeerRegistry::new(
            base_config(),
            torrent_registry,
            tracker_service,
            Arc::new(FakeIdentity),
            &mut lifecycle,
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        registry.add_peer_consumer(
            id,
            Box::new(move |peer| received_clone.lock().unwrap().push(peer)),
        );

        lifecycle.run_startup();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !received.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected at least one peer to be discovered");

        assert_eq!(received.lock().unwrap()[0].address, addr(9001));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    // Scenario 2: a private torrent's extra sources/keys are never queried.
    #[tokio::test]
    async fn private_torrent_ignores_extra_sources() {
        let id = torrent_id(2);
        let mut torrents = HashMap::new();
        torrents.insert(
            id,
            (
                crate::collab::TorrentDescriptor { is_active: true },
                crate::collab::TorrentMeta {
                    announce_key: Some(AnnounceKey::Single("http://primary/a".parse().unwrap())),
                    is_private: true,
                },
            ),
        );

        let primary_calls = Arc::new(AtomicUsize::new(0));
        let extra_calls = Arc::new(AtomicUsize::new(0));

        let torrent_registry = Arc::new(FakeTorrentRegistry { torrents });
        let tracker_service = Arc::new(FakeTrackerService {
            calls: primary_calls.clone(),
            peer_port: 1,
        });
        let mut lifecycle = FakeLifecycle::new();

        let registry = PeerRegistry::new(
            base_config(),
            torrent_registry,
            tracker_service,
            Arc::new(FakeIdentity),
            &mut lifecycle,
        );
        registry.add_peer_source(id, AnnounceKey::Single("http://extra/a".parse().unwrap()));
        registry.add_peer_consumer(id, Box::new(|_| {}));

        let shared = registry.shared.clone();
        sweep(&shared).await;

        assert!(primary_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(extra_calls.load(Ordering::SeqCst), 0);
    }

    // Scenario 3: a tracker echoing our own wildcard-bound address back at us
    // (0.0.0.0:<our port>, the shape a tracker actually reports for a
    // wildcard listener) is dropped before it ever reaches the cache or a
    // subscriber.
    #[tokio::test]
    async fn local_peer_is_never_admitted() {
        let id = torrent_id(3);
        let torrent_registry = Arc::new(FakeTorrentRegistry {
            torrents: HashMap::new(),
        });
        let tracker_service = Arc::new(FakeTrackerService {
            calls: Arc::new(AtomicUsize::new(0)),
            peer_port: 1,
        });
        let mut lifecycle = FakeLifecycle::new();
        let config = base_config();
        let local_port = config.local_peer_port;
        let registry = PeerRegistry::new(
            config,
            torrent_registry,
            tracker_service,
            Arc::new(FakeIdentity),
            &mut lifecycle,
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        registry.add_peer_consumer(
            id,
            Box::new(move |peer| received_clone.lock().unwrap().push(peer)),
        );

        let wildcard_self = Peer::new(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), local_port));
        registry.add_peer(id, wildcard_self);

        assert!(received.lock().unwrap().is_empty());
        assert_eq!(registry.shared.cache.len(), 0);

        let distinct = Peer::new(addr(7000));
        registry.add_peer(id, distinct);
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(registry.shared.cache.len(), 1);
    }

    #[test]
    fn subscribing_twice_delivers_to_both() {
        let torrent_registry = Arc::new(FakeTorrentRegistry {
            torrents: HashMap::new(),
        });
        let tracker_service = Arc::new(FakeTrackerService {
            calls: Arc::new(AtomicUsize::new(0)),
            peer_port: 1,
        });
        let mut lifecycle = FakeLifecycle::new();
        let registry = PeerRegistry::new(
            base_config(),
            torrent_registry,
            tracker_service,
            Arc::new(FakeIdentity),
            &mut lifecycle,
        );

        let id = torrent_id(4);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f1 = first.clone();
        let f2 = second.clone();
        registry.add_peer_consumer(id, Box::new(move |_| { f1.fetch_add(1, Ordering::SeqCst); }));
        registry.add_peer_consumer(id, Box::new(move |_| { f2.fetch_add(1, Ordering::SeqCst); }));

        registry.add_peer(id, Peer::new(addr(5000)));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn torrent_with_no_subscribers_is_not_swept() {
        let id = torrent_id(5);
        let mut torrents = HashMap::new();
        torrents.insert(
            id,
            (
                crate::collab::TorrentDescriptor { is_active: true },
                crate::collab::TorrentMeta {
                    announce_key: Some(AnnounceKey::Single("http://tr/a".parse().unwrap())),
                    is_private: false,
                },
            ),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let torrent_registry = Arc::new(FakeTorrentRegistry { torrents });
        let tracker_service = Arc::new(FakeTrackerService {
            calls: calls.clone(),
            peer_port: 1,
        });
        let mut lifecycle = FakeLifecycle::new();
        let registry = PeerRegistry::new(
            base_config(),
            torrent_registry,
            tracker_service,
            Arc::new(FakeIdentity),
            &mut lifecycle,
        );

        sweep(&registry.shared).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
