#[allow(dead_code)]
mod common;

use std::collections::HashSet;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use common::util::{raw_request, AdmissionHarness};
use rdma_pacer::admission::{client, Reply, Request};
use rdma_pacer::PacerError;

#[test]
fn join_assigns_sequential_slots() {
    let harness = AdmissionHarness::start(8);

    assert_eq!(client::join(harness.path()).unwrap(), 0);
    assert_eq!(client::join(harness.path()).unwrap(), 1);

    let flow = harness.cb.flow(1).unwrap();
    assert!(flow.reserved);
    assert!(!flow.active);
    assert_eq!(flow.chunk_size, 1_048_576);
    assert!(harness.cb.rebalance_pending());
}

#[test]
fn quit_frees_the_slot() {
    let harness = AdmissionHarness::start(2);

    let a = client::join(harness.path()).unwrap();
    let b = client::join(harness.path()).unwrap();
    assert_eq!(
        client::request(harness.path(), Request::Join).unwrap(),
        Reply::Full
    );

    client::quit(harness.path(), a).unwrap();
    assert!(!harness.cb.flow(a as usize).unwrap().reserved);

    assert_eq!(client::join(harness.path()).unwrap(), a);
    assert_ne!(a, b);
}

#[test]
fn bad_quit_is_refused() {
    let harness = AdmissionHarness::start(4);

    assert_eq!(
        client::request(harness.path(), Request::Quit(2)).unwrap(),
        Reply::BadSlot
    );
    assert_eq!(
        client::request(harness.path(), Request::Quit(400)).unwrap(),
        Reply::BadSlot
    );
    assert!(matches!(
        client::quit(harness.path(), 2),
        Err(PacerError::Protocol { .. })
    ));
}

#[test]
fn full_table_refuses_join() {
    let harness = AdmissionHarness::start(1);

    client::join(harness.path()).unwrap();
    assert!(matches!(
        client::join(harness.path()),
        Err(PacerError::Protocol { .. })
    ));
}

#[test]
fn unhandled_messages() {
    let harness = AdmissionHarness::start(4);

    assert_eq!(
        client::request(harness.path(), Request::Read).unwrap(),
        Reply::Peer
    );
    assert_eq!(raw_request(harness.path(), b"hello").unwrap(), b"ERR CMD");
    assert_eq!(raw_request(harness.path(), b"").unwrap(), b"ERR CMD");

    // The server is still up
    assert_eq!(raw_request(harness.path(), b"join\0\0\0\0").unwrap(), b"0");
}

#[test]
fn unpadded_join_without_closing() {
    let harness = AdmissionHarness::start(4);

    let mut stream = UnixStream::connect(harness.path()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.write_all(b"join").unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"0");
    assert!(harness.cb.flow(0).unwrap().reserved);
}

#[test]
fn bytes_after_the_terminator_are_ignored() {
    let harness = AdmissionHarness::start(4);

    assert_eq!(raw_request(harness.path(), b"join\0\x7f\x13A").unwrap(), b"0");
    assert_eq!(raw_request(harness.path(), b"quit 0\0\xff").unwrap(), b"ok");
}

#[test]
fn concurrent_joins_never_share_a_slot() {
    let harness = AdmissionHarness::start(32);

    let threads = (0..8)
        .map(|_| {
            let path = harness.path().to_path_buf();
            thread::spawn(move || {
                (0..4)
                    .map(|_| client::join(&path).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let mut slots = HashSet::new();
    for thread in threads {
        for slot in thread.join().unwrap() {
            assert!(slots.insert(slot), "slot {} assigned twice", slot);
        }
    }

    assert_eq!(slots.len(), 32);
}

#[test]
fn first_send_activates() {
    let harness = AdmissionHarness::start(4);

    let slot = client::join(harness.path()).unwrap();
    let flow = harness.cb.flow_port(slot).unwrap();
    assert!(flow.activate());
    assert_eq!(flow.chunk_size(), 1_048_576);

    assert!(harness.cb.flow(slot as usize).unwrap().active);

    // An active slot is skipped by the next join
    assert_ne!(client::join(harness.path()).unwrap(), slot);
}
