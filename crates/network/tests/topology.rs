mod support;

use arbor_network::{Node, NodeState, PeerTransport};
use arbor_storage::{
    Collection, Database, MemoryStorage, MergeFn, Storage, StorageConfig, StorageError,
};
use arbor_types::{ErrorKind, MasterOrigin, ProvideRegistrationRequest, RegisterRequest, SizeValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use support::{address, config, spawn, LocalTransport};

#[tokio::test]
async fn root_stays_standalone_without_initial_addresses() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4001, &[], 2));

    root.sync().await.unwrap();

    assert_eq!(root.state(), NodeState::Standalone);
    assert!(root.db().get_backlink().unwrap().is_none());
    assert_eq!(root.topology().network_size().unwrap(), 1);
}

#[tokio::test]
async fn joiner_registers_with_root() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4011, &[], 2));
    let joiner = spawn(&transport, config(4012, &[4011], 2));

    joiner.sync().await.unwrap();

    assert_eq!(joiner.state(), NodeState::Registered);
    let backlink = joiner.db().get_backlink().unwrap().unwrap();
    assert_eq!(backlink.address, address(4011));
    assert_eq!(joiner.topology().chain().unwrap(), vec![address(4011)]);
    assert!(root.db().has_slave(&address(4012)).unwrap());

    let master = joiner.db().get_master(&address(4011)).unwrap().unwrap();
    assert_eq!(master.master_origin, MasterOrigin::Upstream);
    assert_eq!(master.size, 1);
    assert_eq!(root.topology().network_size().unwrap(), 2);
    assert_eq!(joiner.topology().network_size().unwrap(), 2);

    let status = root.status().unwrap();
    assert!(status.is_master);
    assert_eq!(status.slaves_count, 1);
}

#[tokio::test]
async fn full_master_sends_joiners_down_the_tree() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4021, &[], 1));
    let a = spawn(&transport, config(4022, &[4021], 1));
    let b = spawn(&transport, config(4023, &[4021], 1));

    a.sync().await.unwrap();
    b.sync().await.unwrap();

    assert_eq!(
        b.db().get_backlink().unwrap().unwrap().address,
        address(4022)
    );
    assert_eq!(b.topology().chain().unwrap(), vec![address(4022), address(4021)]);
    assert!(!root.db().has_slave(&address(4023)).unwrap());

    // The report travels up, the structure travels down.
    a.sync().await.unwrap();
    b.sync().await.unwrap();

    let reported = root.db().get_master(&address(4022)).unwrap().unwrap();
    assert_eq!(reported.master_origin, MasterOrigin::Downstream);
    assert_eq!(reported.size, 1);
    for node in [&root, &a, &b] {
        assert_eq!(node.topology().network_size().unwrap(), 3, "{}", node.address());
    }
}

#[tokio::test]
async fn interview_summary_reports_capacity() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4031, &[], 4));
    let a = spawn(&transport, config(4032, &[4031], 4));
    a.sync().await.unwrap();

    let summary = root
        .topology()
        .interview_summary(&arbor_types::InterviewRequest { network_size: 10 })
        .unwrap();
    assert_eq!(summary.address, address(4031));
    assert_eq!(summary.slaves_count, 1);
    assert_eq!(summary.capacity, 4);
    assert_eq!(summary.headroom(), 3);
    assert!(summary.chain.is_empty());
}

#[tokio::test]
async fn provide_registration_skips_the_target() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4041, &[], 3));
    let a = spawn(&transport, config(4042, &[4041], 3));
    let b = spawn(&transport, config(4043, &[4041], 3));
    a.sync().await.unwrap();
    b.sync().await.unwrap();

    let provided = root
        .topology()
        .provide_registration(&ProvideRegistrationRequest {
            target: address(4042),
        })
        .unwrap();
    assert_eq!(provided.network_size, 3);
    assert_eq!(provided.candidates, vec![address(4041), address(4043)]);
}

#[tokio::test]
async fn persistent_candidate_is_admitted_over_capacity() {
    let transport = LocalTransport::new();
    let mut root_config = config(4051, &[], 1);
    root_config.network.candidate_suspicion_level = SizeValue::Fixed(2);
    let root = spawn(&transport, root_config);
    let a = spawn(&transport, config(4052, &[4051], 1));
    let _b = spawn(&transport, config(4053, &[], 1));
    a.sync().await.unwrap();

    let request = RegisterRequest {
        target: address(4053),
        availability: 50.0,
    };
    let err = root.topology().accept_registration(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interview);
    assert!(root.db().has_slave(&address(4052)).unwrap());

    let response = root.topology().accept_registration(&request).await.unwrap();
    assert_eq!(response.address, address(4051));
    assert_eq!(response.size, 1);
    let slaves: Vec<String> = root
        .db()
        .get_slaves()
        .unwrap()
        .into_iter()
        .map(|slave| slave.address)
        .collect();
    assert_eq!(slaves, vec![address(4053)]);
}

#[tokio::test]
async fn registration_refuses_self_ancestors_and_unreachable_peers() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4061, &[], 2));
    let a = spawn(&transport, config(4062, &[4061], 2));
    a.sync().await.unwrap();

    let own = RegisterRequest {
        target: address(4062),
        availability: 100.0,
    };
    let err = a.topology().accept_registration(&own).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let ancestor = RegisterRequest {
        target: address(4061),
        availability: 100.0,
    };
    let err = a.topology().accept_registration(&ancestor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interview);

    let ghost = RegisterRequest {
        target: address(4069),
        availability: 100.0,
    };
    let err = root.topology().accept_registration(&ghost).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interview);
    let fail = root
        .behavior()
        .get_fail("interview", &address(4069))
        .unwrap()
        .unwrap();
    assert_eq!(fail.up, 1);
}

#[tokio::test]
async fn unreachable_backlink_is_dropped_once_broken() {
    let transport = LocalTransport::new();
    let _root = spawn(&transport, config(4071, &[], 2));
    let mut a_config = config(4072, &[4071], 2);
    a_config.network.server_max_fails = 1;
    let a = spawn(&transport, a_config);
    a.sync().await.unwrap();
    assert_eq!(a.state(), NodeState::Registered);

    transport.set_offline(&address(4071), true);

    a.sync().await.unwrap();
    assert!(a.db().get_backlink().unwrap().is_some());

    a.sync().await.unwrap();
    assert!(a.db().get_backlink().unwrap().is_none());
    assert_eq!(a.state(), NodeState::Standalone);
    assert_eq!(a.topology().network_size().unwrap(), 1);
}

#[tokio::test]
async fn forgotten_slave_registers_again() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4081, &[], 2));
    let a = spawn(&transport, config(4082, &[4081], 2));
    a.sync().await.unwrap();

    root.db().remove_slave(&address(4082)).unwrap();
    a.sync().await.unwrap();

    assert_eq!(a.state(), NodeState::Registered);
    assert!(root.db().has_slave(&address(4082)).unwrap());
    assert_eq!(
        a.db().get_backlink().unwrap().unwrap().address,
        address(4081)
    );
}

#[tokio::test]
async fn shift_slaves_drops_the_oldest_over_capacity() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4091, &[], 1));
    for port in 4092..4095 {
        root.db().add_slave(&address(port), 100.0, None).unwrap();
    }

    let shifted: Vec<String> = root
        .topology()
        .shift_slaves()
        .unwrap()
        .into_iter()
        .map(|slave| slave.address)
        .collect();

    assert_eq!(shifted, vec![address(4092), address(4093)]);
    assert!(root.db().has_slave(&address(4094)).unwrap());
}

#[tokio::test]
async fn silent_slaves_expire() {
    let transport = LocalTransport::new();
    let mut root_config = config(4101, &[], 2);
    root_config.network.slave_lifetime = Some(Duration::from_millis(5));
    let root = spawn(&transport, root_config);
    let a = spawn(&transport, config(4102, &[4101], 2));
    a.sync().await.unwrap();
    assert!(root.db().has_slave(&address(4102)).unwrap());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = root.normalize_servers().unwrap();

    assert!(report.pruned_entries >= 1);
    assert!(!root.db().has_slave(&address(4102)).unwrap());
}

#[tokio::test]
async fn available_node_prefers_free_capacity() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4111, &[], 1));
    let a = spawn(&transport, config(4112, &[4111], 1));
    a.sync().await.unwrap();

    // The root is full; its slave still has a free slot.
    assert_eq!(root.topology().availability().unwrap(), 0.0);
    assert_eq!(root.topology().available_node().unwrap(), address(4112));
}

#[tokio::test]
async fn deregistered_node_stops_syncing() {
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4121, &[], 2));
    let a = spawn(&transport, config(4122, &[4121], 2));
    a.sync().await.unwrap();

    a.deregister().unwrap();
    a.sync().await.unwrap();

    assert_eq!(a.state(), NodeState::Deregistering);
    assert!(a.db().get_backlink().unwrap().is_none());
    assert!(a.db().get_masters().unwrap().is_empty());
    // The root only notices through its own sweeps.
    assert!(root.db().has_slave(&address(4122)).unwrap());
}

#[tokio::test]
async fn sled_node_keeps_its_backlink_across_restarts() {
    let dir = TempDir::new().unwrap();
    let storage = StorageConfig::Sled {
        path: dir.path().join("db"),
    };
    let transport = LocalTransport::new();
    let root = spawn(&transport, config(4131, &[], 2));
    let start = |transport: &Arc<LocalTransport>| {
        let db = Database::new(storage.open().unwrap());
        let node = Arc::new(
            Node::new(
                config(4132, &[4131], 2),
                db,
                transport.clone() as Arc<dyn PeerTransport>,
            )
            .unwrap(),
        );
        node.init().unwrap();
        transport.add(node.clone());
        node
    };

    let a = start(&transport);
    a.sync().await.unwrap();
    a.deinit().unwrap();
    drop(a);

    let a = start(&transport);
    assert_eq!(a.state(), NodeState::Standalone);
    assert_eq!(
        a.db().get_backlink().unwrap().unwrap().address,
        address(4131)
    );
    a.sync().await.unwrap();
    assert_eq!(a.state(), NodeState::Registered);
    assert_eq!(root.db().get_slaves_count().unwrap(), 1);
}

/// Memory storage whose server records can be made read-only.
#[derive(Default)]
struct FreezableServers {
    inner: MemoryStorage,
    frozen: AtomicBool,
}

impl FreezableServers {
    fn check(&self, collection: Collection) -> arbor_storage::Result<()> {
        if collection == Collection::Servers && self.frozen.load(Ordering::SeqCst) {
            return Err(StorageError::NotInitialized);
        }
        Ok(())
    }
}

impl Storage for FreezableServers {
    fn init(&self) -> arbor_storage::Result<()> {
        self.inner.init()
    }
    fn deinit(&self) -> arbor_storage::Result<()> {
        self.inner.deinit()
    }
    fn destroy(&self) -> arbor_storage::Result<()> {
        self.inner.destroy()
    }
    fn get(&self, collection: Collection, key: &str) -> arbor_storage::Result<Option<Vec<u8>>> {
        self.inner.get(collection, key)
    }
    fn insert(&self, collection: Collection, key: &str, value: Vec<u8>) -> arbor_storage::Result<()> {
        self.check(collection)?;
        self.inner.insert(collection, key, value)
    }
    fn remove(&self, collection: Collection, key: &str) -> arbor_storage::Result<Option<Vec<u8>>> {
        self.check(collection)?;
        self.inner.remove(collection, key)
    }
    fn scan_prefix(
        &self,
        collection: Collection,
        prefix: &str,
    ) -> arbor_storage::Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(collection, prefix)
    }
    fn update(
        &self,
        collection: Collection,
        key: &str,
        merge: &mut MergeFn<'_>,
    ) -> arbor_storage::Result<Option<Vec<u8>>> {
        self.check(collection)?;
        self.inner.update(collection, key, merge)
    }
    fn clear(&self, collection: Collection) -> arbor_storage::Result<()> {
        self.check(collection)?;
        self.inner.clear(collection)
    }
    fn len(&self, collection: Collection) -> arbor_storage::Result<usize> {
        self.inner.len(collection)
    }
    fn generate_id(&self) -> arbor_storage::Result<u64> {
        self.inner.generate_id()
    }
}

#[tokio::test]
async fn storage_errors_do_not_mask_an_unreachable_backlink() {
    let transport = LocalTransport::new();
    let _root = spawn(&transport, config(4141, &[], 2));
    let storage = Arc::new(FreezableServers::default());
    let a = Arc::new(
        Node::new(
            config(4142, &[4141], 2),
            Database::new(storage.clone()),
            transport.clone() as Arc<dyn PeerTransport>,
        )
        .unwrap(),
    );
    a.init().unwrap();
    transport.add(a.clone());
    a.sync().await.unwrap();
    assert_eq!(a.state(), NodeState::Registered);

    transport.set_offline(&address(4141), true);
    storage.frozen.store(true, Ordering::SeqCst);
    a.sync().await.unwrap();
    storage.frozen.store(false, Ordering::SeqCst);

    // The transport failure is kept, so an unbroken backlink survives.
    let backlink = a.db().get_backlink().unwrap().unwrap();
    assert_eq!(backlink.address, address(4141));
    assert_eq!(backlink.fails, 0);
}
