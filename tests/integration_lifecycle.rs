//! Stream and socket lifecycle: destroy, relay, firewall, back-pressure,
//! remote changes and socket shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use udx_core::{
    CloseReason, Completion, Error, Event, FirewallVerdict, SocketId, StreamId, UdxConfig,
};
use udx_integration_tests::fixtures::SimPair;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

// ============================================================================
// Destroy
// ============================================================================

#[test]
fn test_destroy_resets_peer() {
    let mut pair = SimPair::new(UdxConfig::default());
    pair.net.set_latency(20);
    let (a, b) = pair.connect(1, 2);

    let queued = pair.a.udx.stream_write(a, &[&pattern(50_000)]).unwrap();
    pair.pump();
    assert!(pair.a.udx.stream_destroy(a).unwrap());
    assert!(pair.run_until(2_000, |p| p.a.closed(a) && p.b.closed(b)));

    assert_eq!(pair.a.closes(a), vec![None]);
    assert_eq!(pair.b.closes(b), vec![Some(CloseReason::ConnectionReset)]);
    assert!(pair.a.events.iter().any(|e| matches!(
        e,
        Event::WriteAck { write, status: Completion::Cancelled, .. } if *write == queued.write
    )));

    assert!(matches!(
        pair.a.udx.stream_write(a, &[b"x"]),
        Err(Error::UnknownStream)
    ));
    assert!(matches!(pair.a.udx.stream_destroy(a), Err(Error::UnknownStream)));
}

#[test]
fn test_close_reported_once() {
    let mut pair = SimPair::new(UdxConfig::default());
    let (a, b) = pair.connect(1, 2);

    pair.a.udx.stream_destroy(a).unwrap();
    pair.run_for(10_000);
    assert_eq!(pair.a.closes(a).len(), 1);
    assert_eq!(pair.b.closes(b).len(), 1);
}

#[test]
fn test_local_id_reusable_after_close() {
    let mut pair = SimPair::new(UdxConfig::default());
    let first = pair.a.udx.stream_init(7).unwrap();
    assert!(pair.a.udx.stream_init(7).is_err());

    assert!(!pair.a.udx.stream_destroy(first).unwrap());
    pair.pump();
    assert_eq!(pair.a.closes(first), vec![None]);

    let second = pair.a.udx.stream_init(7).unwrap();
    assert_ne!(first, second);
    assert_eq!(pair.a.udx.stream_local_id(second).unwrap(), 7);
}

// ============================================================================
// Relay
// ============================================================================

#[test]
fn test_relay_joins_two_streams() {
    let mut pair = SimPair::new(UdxConfig::default());

    // A:1 <-> B:2 relayed to B:3 <-> A:4
    let a1 = pair.a.udx.stream_init(1).unwrap();
    let a4 = pair.a.udx.stream_init(4).unwrap();
    let b2 = pair.b.udx.stream_init(2).unwrap();
    let b3 = pair.b.udx.stream_init(3).unwrap();
    let (sa, sb) = (pair.a.socket, pair.b.socket);
    let (addr_a, addr_b) = (pair.a.addr, pair.b.addr);

    pair.a.udx.stream_connect(a1, sa, 2, addr_b).unwrap();
    pair.a.udx.stream_connect(a4, sa, 3, addr_b).unwrap();
    pair.b.udx.stream_connect(b2, sb, 1, addr_a).unwrap();
    pair.b.udx.stream_connect(b3, sb, 4, addr_a).unwrap();
    pair.b.udx.stream_relay_to(b2, b3).unwrap();
    pair.b.udx.stream_relay_to(b3, b2).unwrap();
    assert!(pair.b.udx.stream_relay_to(b2, b3).is_err());
    pair.a.udx.stream_read_start(a4).unwrap();

    let data = pattern(30_000);
    let queued = pair.a.udx.stream_write_end(a1, &[&data]).unwrap();
    assert!(pair.run_until(10_000, |p| p.a.ended(a4)));
    assert_eq!(pair.a.read_bytes(a4), data);

    // Acknowledgements travel back through the relay too
    assert!(pair.run_until(2_000, |p| {
        p.a.events.iter().any(|e| matches!(
            e,
            Event::WriteAck { write, status: Completion::Completed, .. } if *write == queued.write
        ))
    }));
    assert!(pair.b.read_bytes(b2).is_empty());
    assert!(pair.b.read_bytes(b3).is_empty());
}

#[test]
fn test_relay_forwards_destroy() {
    let mut pair = SimPair::new(UdxConfig::default());
    let a1 = pair.a.udx.stream_init(1).unwrap();
    let a4 = pair.a.udx.stream_init(4).unwrap();
    let b2 = pair.b.udx.stream_init(2).unwrap();
    let b3 = pair.b.udx.stream_init(3).unwrap();
    let (sa, sb) = (pair.a.socket, pair.b.socket);
    let (addr_a, addr_b) = (pair.a.addr, pair.b.addr);

    pair.a.udx.stream_connect(a1, sa, 2, addr_b).unwrap();
    pair.a.udx.stream_connect(a4, sa, 3, addr_b).unwrap();
    pair.b.udx.stream_connect(b2, sb, 1, addr_a).unwrap();
    pair.b.udx.stream_connect(b3, sb, 4, addr_a).unwrap();
    pair.b.udx.stream_relay_to(b2, b3).unwrap();

    pair.a.udx.stream_destroy(a1).unwrap();
    assert!(pair.run_until(2_000, |p| p.a.closed(a4)));

    assert_eq!(pair.a.closes(a1), vec![None]);
    assert_eq!(pair.a.closes(a4), vec![Some(CloseReason::ConnectionReset)]);
    assert_eq!(pair.b.closes(b2), vec![Some(CloseReason::ConnectionReset)]);
}

#[test]
fn test_relay_source_closes_with_target() {
    let mut pair = SimPair::new(UdxConfig::default());
    let a1 = pair.a.udx.stream_init(1).unwrap();
    let a4 = pair.a.udx.stream_init(4).unwrap();
    let b2 = pair.b.udx.stream_init(2).unwrap();
    let b3 = pair.b.udx.stream_init(3).unwrap();
    let (sa, sb) = (pair.a.socket, pair.b.socket);
    let (addr_a, addr_b) = (pair.a.addr, pair.b.addr);

    pair.a.udx.stream_connect(a1, sa, 2, addr_b).unwrap();
    pair.a.udx.stream_connect(a4, sa, 3, addr_b).unwrap();
    pair.b.udx.stream_connect(b2, sb, 1, addr_a).unwrap();
    pair.b.udx.stream_connect(b3, sb, 4, addr_a).unwrap();
    pair.b.udx.stream_relay_to(b2, b3).unwrap();

    pair.b.udx.stream_destroy(b3).unwrap();
    assert!(pair.run_until(2_000, |p| p.b.closed(b2) && p.a.closed(a4)));

    assert_eq!(pair.b.closes(b3), vec![None]);
    assert_eq!(
        pair.b.closes(b2),
        vec![Some(CloseReason::RelayTargetClosed)]
    );
    assert_eq!(pair.a.closes(a4), vec![Some(CloseReason::ConnectionReset)]);
    assert!(pair.b.udx.stream_stats(b2).is_err());
}

// ============================================================================
// Firewall
// ============================================================================

#[test]
fn test_firewall_connects_unknown_peer() {
    let mut pair = SimPair::new(UdxConfig::default());
    let checks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&checks);

    let listener = pair.b.udx.stream_init(2).unwrap();
    let expected_socket = pair.b.socket;
    let expected_from = pair.a.addr;
    pair.b
        .udx
        .stream_set_firewall(
            listener,
            move |_: StreamId, socket: SocketId, from: SocketAddr| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(socket, expected_socket);
                assert_eq!(from, expected_from);
                FirewallVerdict::Connect { remote_id: 1 }
            },
        )
        .unwrap();
    pair.b.udx.stream_read_start(listener).unwrap();

    let a = pair.a.udx.stream_init(1).unwrap();
    let (sa, addr_b) = (pair.a.socket, pair.b.addr);
    pair.a.udx.stream_connect(a, sa, 2, addr_b).unwrap();
    pair.a.udx.stream_read_start(a).unwrap();

    let data = pattern(10_000);
    pair.a.udx.stream_write(a, &[&data]).unwrap();
    assert!(pair.run_until(5_000, |p| p.b.read_len(listener) == data.len()));
    assert_eq!(pair.b.read_bytes(listener), data);
    assert_eq!(checks.load(Ordering::SeqCst), 1);
    assert_eq!(
        pair.b.udx.stream_remote_addr(listener).unwrap(),
        Some(pair.a.addr)
    );

    // The connection works in the other direction as well
    pair.b.udx.stream_write(listener, &[b"welcome"]).unwrap();
    assert!(pair.run_until(2_000, |p| p.a.read_len(a) == 7));
}

#[test]
fn test_firewall_rejects() {
    let mut pair = SimPair::new(UdxConfig::default());
    let checks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&checks);

    let guarded = pair.b.udx.stream_init(2).unwrap();
    pair.b
        .udx
        .stream_set_firewall(guarded, move |_: StreamId, _: SocketId, _: SocketAddr| {
            seen.fetch_add(1, Ordering::SeqCst);
            FirewallVerdict::Reject
        })
        .unwrap();
    pair.b.udx.stream_read_start(guarded).unwrap();

    let a = pair.a.udx.stream_init(1).unwrap();
    let (sa, addr_b) = (pair.a.socket, pair.b.addr);
    pair.a.udx.stream_connect(a, sa, 2, addr_b).unwrap();
    pair.a.udx.stream_write(a, &[b"let me in"]).unwrap();
    pair.run_for(3_000);

    assert!(pair.b.read_bytes(guarded).is_empty());
    assert!(checks.load(Ordering::SeqCst) >= 2);
    assert_eq!(pair.b.udx.stream_remote_addr(guarded).unwrap(), None);
}

// ============================================================================
// Back-pressure
// ============================================================================

#[test]
fn test_backpressure_and_single_drain() {
    let config = UdxConfig::default();
    let mut pair = SimPair::new(config.clone());
    let (a, b) = pair.connect(1, 2);

    let first = pair.a.udx.stream_write(a, &[&pattern(100_000)]).unwrap();
    assert!(first.can_continue);

    // Past the high watermark plus one initial window (3 * 1152 bytes)
    let big = pattern(config.high_watermark);
    let second = pair.a.udx.stream_write(a, &[&big]).unwrap();
    assert!(!second.can_continue);
    let third = pair.a.udx.stream_write(a, &[b"more"]).unwrap();
    assert!(!third.can_continue);

    let total = 100_000 + big.len() + 4;
    assert!(pair.run_until(60_000, |p| p.b.read_len(b) == total));
    assert_eq!(pair.a.count(|e| matches!(e, Event::Drain { .. })), 1);

    let after = pair.a.udx.stream_write(a, &[b"calm"]).unwrap();
    assert!(after.can_continue);
}

// ============================================================================
// Remote changes
// ============================================================================

#[test]
fn test_change_remote_idle_is_immediate() {
    let mut pair = SimPair::new(UdxConfig::default());
    let (a, b) = pair.connect(1, 2);
    let b3 = pair.b.udx.stream_init(3).unwrap();
    let (sa, sb) = (pair.a.socket, pair.b.socket);
    let (addr_a, addr_b) = (pair.a.addr, pair.b.addr);
    pair.b.udx.stream_connect(b3, sb, 1, addr_a).unwrap();
    pair.b.udx.stream_read_start(b3).unwrap();

    let idle = pair.b.udx.stream_init(9).unwrap();
    assert!(matches!(
        pair.b.udx.stream_change_remote(idle, sb, 1, addr_a),
        Err(Error::NotConnected)
    ));

    pair.a.udx.stream_change_remote(a, sa, 3, addr_b).unwrap();
    pair.pump();
    assert_eq!(
        pair.a.count(|e| matches!(e, Event::RemoteChanged { stream } if *stream == a)),
        1
    );

    pair.a.udx.stream_write(a, &[b"moved"]).unwrap();
    assert!(pair.run_until(2_000, |p| p.b.read_len(b3) == 5));
    assert!(pair.b.read_bytes(b).is_empty());
}

#[test]
fn test_change_remote_waits_for_inflight() {
    let mut pair = SimPair::new(UdxConfig::default());
    pair.net.set_latency(50);
    let (a, b) = pair.connect(1, 2);
    let b3 = pair.b.udx.stream_init(3).unwrap();
    let (sa, sb) = (pair.a.socket, pair.b.socket);
    let (addr_a, addr_b) = (pair.a.addr, pair.b.addr);
    pair.b.udx.stream_connect(b3, sb, 1, addr_a).unwrap();
    pair.b.udx.stream_read_start(b3).unwrap();

    pair.a.udx.stream_write(a, &[b"before"]).unwrap();
    pair.pump();
    assert!(pair.a.udx.stream_stats(a).unwrap().pkts_inflight > 0);

    pair.a.udx.stream_change_remote(a, sa, 3, addr_b).unwrap();
    pair.pump();
    assert_eq!(pair.a.count(|e| matches!(e, Event::RemoteChanged { .. })), 0);

    assert!(pair.run_until(2_000, |p| {
        p.a.count(|e| matches!(e, Event::RemoteChanged { .. })) == 1
    }));
    assert_eq!(pair.b.read_bytes(b), b"before");
    pair.run_for(2_000);
    assert_eq!(pair.a.count(|e| matches!(e, Event::RemoteChanged { .. })), 1);
}

// ============================================================================
// Socket shutdown
// ============================================================================

#[test]
fn test_socket_close_cancels_queued_sends() {
    let mut pair = SimPair::new(UdxConfig::default());
    let socket = pair.a.socket;
    let to = pair.b.addr;
    pair.net.set_blocked(true);

    let send = pair.a.udx.socket_send(socket, b"never", to).unwrap();
    pair.pump();
    assert!(pair.a.udx.timer_active());

    pair.a.udx.socket_close(socket).unwrap();
    pair.pump();

    let kinds: Vec<_> = pair
        .a
        .events
        .iter()
        .filter(|e| matches!(e, Event::SocketSent { .. } | Event::SocketClose { .. }))
        .cloned()
        .collect();
    assert_eq!(
        kinds,
        vec![
            Event::SocketSent {
                socket,
                send,
                status: Completion::Cancelled
            },
            Event::SocketClose { socket },
        ]
    );
    assert!(!pair.a.udx.socket_is_open(socket));
    assert!(!pair.a.udx.timer_active());
    assert!(pair.a.udx.socket_send(socket, b"late", to).is_err());
}

#[test]
fn test_socket_close_waits_for_stream_output() {
    let mut pair = SimPair::new(UdxConfig::default());
    let (a, _b) = pair.connect(1, 2);
    let socket = pair.a.socket;
    pair.net.set_blocked(true);

    pair.a.udx.stream_write(a, &[b"flush me"]).unwrap();
    pair.a.udx.socket_close(socket).unwrap();
    assert!(matches!(
        pair.a.udx.socket_send(socket, b"no", pair.b.addr),
        Err(Error::SocketClosing)
    ));
    pair.run_for(200);
    assert!(pair.a.udx.socket_is_open(socket));
    assert_eq!(pair.a.count(|e| matches!(e, Event::SocketClose { .. })), 0);

    pair.net.set_blocked(false);
    assert!(pair.run_until(2_000, |p| {
        p.a.count(|e| matches!(e, Event::SocketClose { .. })) == 1
    }));
    assert!(
        pair.net
            .log()
            .iter()
            .any(|c| c.data.ends_with(b"flush me"))
    );
}
