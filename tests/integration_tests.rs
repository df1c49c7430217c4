//! End-to-end scenarios across the dctide crates.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use dctide_core::{
    DlErrorKind, DownloadTask, HubApi, PeerSession, Priority, QueueEvent, ReceiveContext,
    ReceiveOutcome, Uid, UserState,
};
use dctide_db::{queries, DbReply, DbRequest, Flags, Param, QueryRequest};
use dctide_hash::leaves_to_blob;
use dctide_integration_tests::{hashed_content, uid, QueueHarness};
use dctide_net::{listener, BindRequest, BindType, NetError, RandomPorts};

struct TestHub {
    online: Vec<Uid>,
    connects: Vec<Uid>,
}

impl HubApi for TestHub {
    fn user_online(&self, u: Uid) -> bool {
        self.online.contains(&u)
    }
    fn request_connect(&mut self, u: Uid) {
        self.connects.push(u);
    }
    fn notify_passive(&mut self, _reason: &str) {}
}

struct TestSession;
impl PeerSession for TestSession {
    fn download(&mut self, _task: DownloadTask) {}
    fn disconnect(&mut self, _force: bool) {}
}

/// Enqueue a file, receive a verified TTHL and four good blocks, and
/// watch it land at its destination with the queue and spool clean.
#[test]
fn queue_add_and_complete() {
    let mut h = QueueHarness::new();
    let (data, root, leaves) = hashed_content(4 << 20, 1 << 20);

    assert!(h.queue.add_file(uid(1), root, 4 << 20, "d/f"));
    h.queue.user_cc(uid(1), true);
    h.queue.set_tthl(uid(1), root, &leaves_to_blob(&leaves));
    assert!(h.queue.record(&root).unwrap().has_tthl);

    let mut ctx = ReceiveContext::start(&mut h.queue, uid(1), root).unwrap();
    for block in data.chunks(1 << 20) {
        ctx.recv_data(&mut h.queue, block);
    }
    assert_eq!(ctx.finish(&mut h.queue), ReceiveOutcome::Finalized);

    // Record gone, incoming file gone, destination in place.
    assert!(h.queue.record(&root).is_none());
    assert!(!h.incoming(&root).exists());
    let dest = h.dir.path().join("dl").join("d/f");
    assert_eq!(std::fs::read(dest).unwrap(), data);

    // And gone from the store too.
    let rows = h.db.handle().fetch(queries::DL_LOAD, vec![]).unwrap();
    assert!(rows.is_empty());
}

/// The second block's last byte is flipped: `have` rewinds to 1 MiB,
/// the incoming file truncates, the error lands on the user, and that
/// user sinks in its own queue.
#[test]
fn hash_mismatch_mid_file() {
    let mut h = QueueHarness::new();
    let (mut data, root, leaves) = hashed_content(4 << 20, 1 << 20);
    data[(2 << 20) - 1] ^= 0x01;

    h.queue.add_file(uid(1), root, 4 << 20, "d/f");
    // A second, healthy download so the demotion is observable.
    let (_, other, _) = hashed_content(1 << 20, 1 << 20);
    h.queue.add_file(uid(1), other, 1 << 20, "d/g");
    h.queue.set_tthl(uid(1), root, &leaves_to_blob(&leaves));
    h.queue.set_priority(root, Priority::VeryHigh);

    // Highest priority first before the failure.
    assert_eq!(
        h.queue.user(uid(1)).unwrap().queue[0].tth,
        root
    );

    let mut ctx = ReceiveContext::start(&mut h.queue, uid(1), root).unwrap();
    for block in data.chunks(1 << 20) {
        if !ctx.recv_data(&mut h.queue, block) {
            break;
        }
    }
    assert_eq!(ctx.finish(&mut h.queue), ReceiveOutcome::Incomplete);

    let rec = h.queue.record(&root).unwrap();
    assert_eq!(rec.have, 1 << 20);
    assert_eq!(
        std::fs::metadata(h.incoming(&root)).unwrap().len(),
        1 << 20
    );
    let user = h.queue.user(uid(1)).unwrap();
    assert_eq!(user.entry(&root).unwrap().error, DlErrorKind::HashMismatch);
    // The tainted entry sank below the healthy one despite priority.
    assert_eq!(user.queue[0].tth, other);
}

/// TCP on the wildcard and TLS on an interface cannot share a port;
/// resolution reports the conflict so the caller can fall back to
/// passive mode.
#[test]
fn listener_conflict_aborts() {
    let ports = RandomPorts {
        tcp: 40001,
        udp: 40002,
        tls: 40003,
    };
    let err = listener::resolve(
        &[
            BindRequest {
                hub: 1,
                typ: BindType::Tcp,
                ip: Ipv4Addr::UNSPECIFIED,
                port: 1412,
            },
            BindRequest {
                hub: 2,
                typ: BindType::Tls,
                ip: Ipv4Addr::new(192, 0, 2, 5),
                port: 1412,
            },
        ],
        &ports,
    )
    .unwrap_err();
    assert_eq!(err, NetError::BindConflict { port: 1412 });
}

/// A later wildcard bind absorbs an interface-specific one; one bind
/// remains, carrying both hubs.
#[test]
fn listener_wildcard_merge() {
    let ports = RandomPorts {
        tcp: 40001,
        udp: 40002,
        tls: 40003,
    };
    let binds = listener::resolve(
        &[
            BindRequest {
                hub: 1,
                typ: BindType::Tcp,
                ip: Ipv4Addr::new(192, 0, 2, 5),
                port: 1412,
            },
            BindRequest {
                hub: 2,
                typ: BindType::Tcp,
                ip: Ipv4Addr::UNSPECIFIED,
                port: 1412,
            },
        ],
        &ports,
    )
    .unwrap();
    assert_eq!(binds.len(), 1);
    assert!(binds[0].ip.is_unspecified());
    assert_eq!(binds[0].hubs.len(), 2);
}

/// A per-user failure leaves the sibling source untouched; the next
/// pass picks the healthy user.
#[test]
fn per_user_failure_does_not_block_siblings() {
    let mut h = QueueHarness::new();
    let (_, root, _) = hashed_content(4 << 20, 1 << 20);
    h.queue.add_file(uid(1), root, 4 << 20, "f");
    h.queue.match_file(uid(2), root);
    h.queue
        .set_user_error(uid(1), Some(root), DlErrorKind::NotAvailable, "gone");
    h.queue.user_cc(uid(1), true);
    h.queue.user_cc(uid(2), true);

    let mut hub = TestHub {
        online: vec![],
        connects: vec![],
    };
    let mut sessions: HashMap<Uid, Box<dyn PeerSession>> = HashMap::new();
    sessions.insert(uid(1), Box::new(TestSession));
    sessions.insert(uid(2), Box::new(TestSession));

    let outcome = h.queue.select_pass(&mut hub, &mut sessions, 2);
    assert_eq!(outcome.started, [uid(2)]);
    assert_eq!(h.queue.user(uid(2)).unwrap().state, UserState::Active);
    assert_eq!(h.queue.user(uid(1)).unwrap().state, UserState::Idle);
}

/// Three chained inserts with an error on the second: nothing persists
/// and every reply channel observes an error.
#[test]
fn persistence_atomicity() {
    let svc = dctide_db::DbService::open_in_memory().unwrap();
    let h = svc.handle();
    h.exec(
        queries::SHARE_UPSERT,
        vec![Param::Text("dup".into()), Param::Text("/dup".into())],
    );

    const RAW_INSERT: &str = "INSERT INTO share (name, path) VALUES (?1, ?2)";
    let chain = Flags {
        chain_next: true,
        ..Flags::default()
    };
    let mut replies = Vec::new();
    for (name, flags) in [
        ("alpha", chain),
        ("dup", chain),
        ("omega", Flags::default()),
    ] {
        let (tx, rx) = crossbeam_channel::unbounded();
        h.submit(DbRequest::Query(QueryRequest {
            sql: RAW_INSERT,
            params: vec![Param::Text(name.into()), Param::Text("/p".into())],
            flags,
            reply: Some(tx),
            columns: None,
            want_last_insert: false,
        }));
        replies.push(rx);
    }

    for rx in &replies {
        let status = loop {
            match rx.recv().unwrap() {
                DbReply::Row(_) => {}
                DbReply::Done { result, .. } => break result,
            }
        };
        assert!(status.is_err());
    }

    let rows = h.fetch(queries::SHARE_LOAD, vec![]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].as_text(), Some("dup"));
}

/// Causality: once the UI hears `Active` for a user, the next state it
/// hears for that user is `Idle` or `WaitingReconnect`.
#[test]
fn user_state_events_are_causal() {
    let mut h = QueueHarness::new();
    let (_, root, _) = hashed_content(4 << 20, 1 << 20);
    h.queue.add_file(uid(1), root, 4 << 20, "f");
    h.queue.user_cc(uid(1), true);

    let mut hub = TestHub {
        online: vec![],
        connects: vec![],
    };
    let mut sessions: HashMap<Uid, Box<dyn PeerSession>> = HashMap::new();
    sessions.insert(uid(1), Box::new(TestSession));
    h.queue.select_pass(&mut hub, &mut sessions, 1);
    h.queue.transfer_done(uid(1));
    h.queue.user_cc(uid(1), false);

    let mut states = Vec::new();
    while let Ok(ev) = h.events.try_recv() {
        if let QueueEvent::UserState(_, s) = ev {
            states.push(s);
        }
    }
    let active_pos = states
        .iter()
        .position(|s| *s == UserState::Active)
        .expect("active reported");
    assert!(matches!(
        states[active_pos + 1],
        UserState::Idle | UserState::WaitingReconnect
    ));
}

/// A zero-size regular file completes on its first receive cycle.
#[test]
fn zero_size_file_completes_immediately() {
    let mut h = QueueHarness::new();
    let (_, root, _) = hashed_content(0, 1 << 20);
    h.queue.add_file(uid(1), root, 0, "empty.bin");

    let ctx = ReceiveContext::start(&mut h.queue, uid(1), root).unwrap();
    assert_eq!(ctx.finish(&mut h.queue), ReceiveOutcome::Finalized);
    assert!(h.queue.record(&root).is_none());
}
