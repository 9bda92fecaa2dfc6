//! End-to-end scenarios across crate boundaries: hook parking under
//! pressure, and lease durability through the memfile journal.
use std::{sync::Arc, time::Duration};

use chrono::Utc;

use alloc_engine::{AllocEngine, Client4};
use config::DhcpConfig;
use hearth_core::{
    chrono::TimeDelta,
    hook::ParkingLot,
    perfmon::{Family, MonitoredDurationStore},
    proto::{
        Encodable,
        v4::{DhcpOption, Message, MessageType},
    },
    server::{State, context::MsgContext, msg::SerialMsg},
    stats::StatsMgr,
    unix_udp_sock::RecvMeta,
};
use lease_store::{LeaseState, LeaseStore};

fn test_state(stats: Arc<StatsMgr>) -> Arc<State> {
    Arc::new(State::new(
        100,
        stats,
        Arc::new(MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(60)).unwrap()),
    ))
}

fn discover_ctx(state: Arc<State>, xid: u32) -> MsgContext<Message> {
    let uns = std::net::Ipv4Addr::UNSPECIFIED;
    let mut msg = Message::new_with_id(xid, uns, uns, uns, uns, &[0xaa, 0xbb, 0xcc, 0, 0, 1]);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));
    let addr: std::net::SocketAddr = "192.0.2.9:68".parse().unwrap();
    let meta = RecvMeta {
        addr,
        ..RecvMeta::default()
    };
    MsgContext::new(
        SerialMsg::new(msg.to_vec().unwrap().into(), addr),
        meta,
        state,
        None,
    )
    .unwrap()
}

// with a parked-packet limit of 2, the third park degrades to a drop and
// `parking-lot-full` is counted
#[tokio::test]
async fn parking_lot_overflow_degrades_to_drop() {
    let stats = Arc::new(StatsMgr::new());
    let state = test_state(Arc::clone(&stats));
    let (lot, mut resume_rx) = ParkingLot::<Message>::new(
        2,
        Duration::from_secs(120),
        Arc::clone(&stats),
        "pkt4-receive-drop",
    );

    assert!(lot.park(1, discover_ctx(Arc::clone(&state), 1), 0).is_ok());
    assert!(lot.park(2, discover_ctx(Arc::clone(&state), 2), 0).is_ok());
    // third one bounces
    let third = lot.park(3, discover_ctx(Arc::clone(&state), 3), 0);
    assert!(third.is_err());
    assert_eq!(stats.get_integer("parking-lot-full"), 1);
    assert_eq!(lot.len(), 2);

    // a parked transaction resumes through the worker channel
    assert!(lot.resume(1));
    let resumed = resume_rx.recv().await.unwrap();
    assert_eq!(resumed.resume_at, 0);
    assert_eq!(lot.len(), 1);

    // resuming an unknown xid is a no-op
    assert!(!lot.resume(99));

    // hook-side drop
    assert!(lot.drop_parked(2));
    assert_eq!(stats.get_integer("pkt4-receive-drop"), 1);
    assert!(lot.is_empty());
}

// overstaying transactions are swept out with a counted drop; shutdown
// drains whatever is left
#[tokio::test]
async fn parked_transactions_never_leak() {
    let stats = Arc::new(StatsMgr::new());
    let state = test_state(Arc::clone(&stats));
    // zero timeout: everything is overdue immediately
    let (lot, _resume_rx) = ParkingLot::<Message>::new(
        8,
        Duration::ZERO,
        Arc::clone(&stats),
        "pkt4-receive-drop",
    );

    lot.park(1, discover_ctx(Arc::clone(&state), 1), 0).unwrap();
    lot.park(2, discover_ctx(Arc::clone(&state), 2), 0).unwrap();
    assert_eq!(lot.sweep(std::time::Instant::now()), 2);
    assert_eq!(stats.get_integer("pkt4-receive-drop"), 2);

    lot.park(3, discover_ctx(Arc::clone(&state), 3), 0).unwrap();
    assert_eq!(lot.drain(), 1);
    assert!(lot.is_empty());
}

const YAML: &str = r#"
networks:
  - subnet: 192.0.2.0/24
    authoritative: true
    pools:
      - start: 192.0.2.100
        end: 192.0.2.199
        lease_time:
          default: 4000
"#;

// a committed lease survives a restart via the memfile journal, and the
// journal refuses to reuse an address that is still bound
#[tokio::test]
async fn leases_survive_restart_through_memfile() {
    let dir = tempfile::tempdir().unwrap();
    let path4 = dir.path().join("leases4.csv");
    let path6 = dir.path().join("leases6.csv");
    let cfg = DhcpConfig::parse_str(YAML).unwrap();
    let network = cfg.v4().network([192, 0, 2, 1]).unwrap();
    let client = Client4::new(&[0xaa, 0xbb, 0xcc, 0, 0, 7], Some(&[7, 7, 7]));

    {
        let store = Arc::new(LeaseStore::with_memfile(&path4, &path6).unwrap());
        let engine = AllocEngine::new(Arc::clone(&store), None);
        let now = Utc::now();
        let grant = engine
            .offer(network, &client, None, None, None, None, false, now)
            .unwrap();
        engine
            .commit(network, &client, grant.addr, None, None, now)
            .unwrap();
    }

    // "restart": reopen the journals into a fresh store
    let store = Arc::new(LeaseStore::with_memfile(&path4, &path6).unwrap());
    assert_eq!(store.len4(), 1);
    let lease = store.get_by_address([192, 0, 2, 100].into()).unwrap();
    assert_eq!(lease.state, LeaseState::Default);
    assert_eq!(lease.client_id.as_deref(), Some(&[7u8, 7, 7][..]));
    assert_eq!(lease.valid_lifetime, 4000);

    // the reloaded store still refuses the address to another client
    let engine = AllocEngine::new(store, None);
    let thief = Client4::new(&[9, 9, 9, 9, 9, 9], Some(&[9]));
    let grant = engine
        .offer(network, &thief, Some([192, 0, 2, 100].into()), None, None, None, false, Utc::now())
        .unwrap();
    assert_ne!(grant.addr, std::net::Ipv4Addr::from([192, 0, 2, 100]));
}
