mod common;

use common::{tcp_frame, CLI, SRV};
use muninn_lib::frame::tcp_flags::{ACK, FIN, PSH, RST, SYN};
use muninn_lib::gapstring::Chunk;
use muninn_lib::reseq::{Direction, Emission, TcpResequencer};

/// Handshake + one "GET" / "OK" exchange.
fn clean_exchange() -> Vec<muninn_lib::Frame> {
    vec![
        tcp_frame(0, CLI, SRV, 1000, 0, SYN, b""),
        tcp_frame(1, SRV, CLI, 5000, 1001, SYN | ACK, b""),
        tcp_frame(2, CLI, SRV, 1001, 5001, ACK, b""),
        tcp_frame(3, CLI, SRV, 1001, 5001, PSH | ACK, b"GET"),
        tcp_frame(4, SRV, CLI, 5001, 1004, ACK, b""),
        tcp_frame(5, SRV, CLI, 5001, 1004, PSH | ACK, b"OK"),
        tcp_frame(6, CLI, SRV, 1004, 5003, ACK, b""),
    ]
}

fn run(frames: &[muninn_lib::Frame]) -> (TcpResequencer, Vec<Emission>) {
    let mut reseq = TcpResequencer::new();
    let emissions = frames.iter().filter_map(|f| reseq.handle(f)).collect();
    (reseq, emissions)
}

fn text(e: &Emission) -> Vec<u8> {
    e.data
        .contiguous()
        .unwrap_or_else(|| panic!("emission has gaps: {:?}", e.data))
        .to_vec()
}

#[test]
fn clean_handshake_request_reply() {
    let (reseq, emissions) = run(&clean_exchange());

    assert_eq!(emissions.len(), 2);
    assert_eq!(emissions[0].dir, Direction::ClientToServer);
    assert_eq!(text(&emissions[0]), b"GET");
    assert_eq!(emissions[1].dir, Direction::ServerToClient);
    assert_eq!(text(&emissions[1]), b"OK");

    assert!(!reseq.midstream());
    assert_eq!(reseq.client(), Some(CLI));
    assert_eq!(reseq.server(), Some(SRV));

    // The first frame of the request bundle is the request itself.
    let first = emissions[0].first.as_ref().expect("first frame");
    assert_eq!(first.tcp().unwrap().seq, 1001);
}

#[test]
fn reordered_segments_reassemble_in_sequence_order() {
    // Client ships "GE" then "T"; the capture has them swapped.
    let frames = vec![
        tcp_frame(0, CLI, SRV, 1000, 0, SYN, b""),
        tcp_frame(1, SRV, CLI, 5000, 1001, SYN | ACK, b""),
        tcp_frame(2, CLI, SRV, 1001, 5001, ACK, b""),
        tcp_frame(3, CLI, SRV, 1003, 5001, PSH | ACK, b"T"),
        tcp_frame(4, CLI, SRV, 1001, 5001, PSH | ACK, b"GE"),
        tcp_frame(5, SRV, CLI, 5001, 1004, ACK, b""),
    ];
    let (_, emissions) = run(&frames);

    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].dir, Direction::ClientToServer);
    assert_eq!(text(&emissions[0]), b"GET");
}

#[test]
fn dropped_segment_becomes_one_gap() {
    // The "GET" segment never made it into the capture, but the server's
    // ACK did: the emission is exactly a three byte hole.
    let frames = vec![
        tcp_frame(0, CLI, SRV, 1000, 0, SYN, b""),
        tcp_frame(1, SRV, CLI, 5000, 1001, SYN | ACK, b""),
        tcp_frame(2, CLI, SRV, 1001, 5001, ACK, b""),
        tcp_frame(3, SRV, CLI, 5001, 1004, ACK, b""),
    ];
    let (_, emissions) = run(&frames);

    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].dir, Direction::ClientToServer);
    assert_eq!(emissions[0].data.len(), 3);
    assert_eq!(emissions[0].data.missing(), 3);
    assert!(matches!(emissions[0].data.chunks(), [Chunk::Gap(3)]));
}

#[test]
fn midstream_start_is_flagged_and_emits_nothing() {
    let mut reseq = TcpResequencer::new();

    let first = tcp_frame(0, CLI, SRV, 2000, 9000, ACK, b"abc");
    assert!(reseq.handle(&first).is_none());
    assert!(reseq.midstream());
    assert_eq!(reseq.client(), Some(CLI));
    assert_eq!(reseq.server(), Some(SRV));

    // The opposite side ACKing past 2000 releases the buffered bytes.
    let reply = tcp_frame(1, SRV, CLI, 9000, 2003, ACK, b"xyz");
    let emission = reseq.handle(&reply).expect("emission");
    assert_eq!(emission.dir, Direction::ClientToServer);
    assert_eq!(text(&emission), b"abc");
}

#[test]
fn rst_flushes_once_then_discards() {
    let frames = vec![
        tcp_frame(0, CLI, SRV, 1000, 0, SYN, b""),
        tcp_frame(1, SRV, CLI, 5000, 1001, SYN | ACK, b""),
        tcp_frame(2, CLI, SRV, 1001, 5001, ACK, b""),
        tcp_frame(3, CLI, SRV, 1001, 5001, PSH | ACK, b"GET"),
    ];
    let (mut reseq, emissions) = run(&frames);
    assert!(emissions.is_empty());

    let rst = tcp_frame(4, SRV, CLI, 5001, 1004, RST | ACK, b"");
    let flushed = reseq.handle(&rst).expect("flush on reset");
    assert_eq!(flushed.dir, Direction::ClientToServer);
    assert_eq!(text(&flushed), b"GET");
    assert!(reseq.is_closed());

    // Anything after the reset is discarded.
    let late = tcp_frame(5, CLI, SRV, 1004, 5001, PSH | ACK, b"more");
    assert!(reseq.handle(&late).is_none());
}

#[test]
fn port_reuse_restarts_the_flow() {
    let mut reseq = TcpResequencer::new();
    for f in clean_exchange() {
        reseq.handle(&f);
    }
    let rst = tcp_frame(7, CLI, SRV, 1004, 5003, RST, b"");
    reseq.handle(&rst);
    assert!(reseq.is_closed());

    // Fresh SYN on the same endpoints: everything starts over.
    let frames = vec![
        tcp_frame(10, CLI, SRV, 3000, 0, SYN, b""),
        tcp_frame(11, SRV, CLI, 7000, 3001, SYN | ACK, b""),
        tcp_frame(12, CLI, SRV, 3001, 7001, ACK, b""),
        tcp_frame(13, CLI, SRV, 3001, 7001, PSH | ACK, b"hi"),
        tcp_frame(14, SRV, CLI, 7001, 3003, ACK, b""),
    ];
    let emissions: Vec<Emission> = frames.iter().filter_map(|f| reseq.handle(f)).collect();
    assert!(!reseq.is_closed());
    assert!(!reseq.midstream());
    assert_eq!(emissions.len(), 1);
    assert_eq!(text(&emissions[0]), b"hi");
}

#[test]
fn retransmit_is_idempotent() {
    let mut frames = clean_exchange();
    // Duplicate the request segment right after itself.
    frames.insert(4, frames[3].clone());

    let (_, baseline) = run(&clean_exchange());
    let (_, with_dup) = run(&frames);

    assert_eq!(with_dup.len(), baseline.len());
    for (a, b) in baseline.iter().zip(with_dup.iter()) {
        assert_eq!(a.dir, b.dir);
        assert_eq!(a.data, b.data);
    }
}

#[test]
fn emitted_bytes_match_acked_span() {
    // Client sends 4 + 3 bytes in two segments; one server ACK claims both.
    let frames = vec![
        tcp_frame(0, CLI, SRV, 1000, 0, SYN, b""),
        tcp_frame(1, SRV, CLI, 5000, 1001, SYN | ACK, b""),
        tcp_frame(2, CLI, SRV, 1001, 5001, ACK, b""),
        tcp_frame(3, CLI, SRV, 1001, 5001, PSH | ACK, b"AAAA"),
        tcp_frame(4, CLI, SRV, 1005, 5001, PSH | ACK, b"BBB"),
        tcp_frame(5, SRV, CLI, 5001, 1008, ACK, b""),
    ];
    let (_, emissions) = run(&frames);

    let total: u64 = emissions
        .iter()
        .filter(|e| e.dir == Direction::ClientToServer)
        .map(|e| e.data.len())
        .sum();
    assert_eq!(total, 1008 - 1001);
    assert_eq!(text(&emissions[0]), b"AAAABBB");
}

#[test]
fn fin_exchange_closes_both_directions() {
    let mut frames = clean_exchange();
    frames.extend([
        tcp_frame(7, CLI, SRV, 1004, 5003, FIN | ACK, b""),
        tcp_frame(8, SRV, CLI, 5003, 1005, FIN | ACK, b""),
        tcp_frame(9, CLI, SRV, 1005, 5004, ACK, b""),
    ]);
    let (reseq, emissions) = run(&frames);

    assert!(reseq.is_closed());
    // The teardown rounds emit empty bundles; no payload bytes appear.
    let extra: u64 = emissions.iter().skip(2).map(|e| e.data.len()).sum();
    assert_eq!(extra, 0);
}
