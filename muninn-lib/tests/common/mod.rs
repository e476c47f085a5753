#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use muninn_lib::frame::{Frame, ETHERTYPE_IP, IPPROTO_TCP};

pub const CLI: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 0, 0, 1), 1234);
pub const SRV: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 0, 0, 2), 80);

/// Raw Ethernet+IPv4+TCP frame bytes, minimal headers, no options.
pub fn raw_tcp(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut b = Vec::with_capacity(54 + payload.len());
    b.extend_from_slice(&[0x11; 6]);
    b.extend_from_slice(&[0x22; 6]);
    b.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());

    b.push(0x45);
    b.push(0);
    b.extend_from_slice(&(40 + payload.len() as u16).to_be_bytes());
    b.extend_from_slice(&[0, 0]); // id
    b.extend_from_slice(&0x4000u16.to_be_bytes());
    b.push(64);
    b.push(IPPROTO_TCP);
    b.extend_from_slice(&[0, 0]); // checksum (unvalidated)
    b.extend_from_slice(&src.0.octets());
    b.extend_from_slice(&dst.0.octets());

    b.extend_from_slice(&src.1.to_be_bytes());
    b.extend_from_slice(&dst.1.to_be_bytes());
    b.extend_from_slice(&seq.to_be_bytes());
    b.extend_from_slice(&ack.to_be_bytes());
    b.push(0x50);
    b.push(flags);
    b.extend_from_slice(&0xff00u16.to_be_bytes());
    b.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    b.extend_from_slice(payload);
    b
}

/// Decoded test frame at `ts_ms` milliseconds since the epoch.
pub fn tcp_frame(
    ts_ms: u64,
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Frame {
    Frame::decode(
        Duration::from_millis(ts_ms),
        Bytes::from(raw_tcp(src, dst, seq, ack, flags, payload)),
    )
    .expect("valid test frame")
}
