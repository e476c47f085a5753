//! Synthesized capture writer.
//!
//! Re-emits a reconstructed (or invented) conversation as a well-formed
//! capture: handshake, data segments, teardown. Useful for round-tripping a
//! decoded flow into tools that only eat pcap. The frames are deliberately
//! plain: fixed link addresses, no TCP options, zero TCP checksums.

use std::borrow::Cow;
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use pcap_file::pcap::{PcapPacket, PcapWriter};

use crate::error::Result;
use crate::frame::{tcp_flags, ETHERTYPE_IP, IPPROTO_TCP};

/// Payload bytes per synthesized segment.
const MAX_SEGMENT: usize = 0xff00;
/// Start-of-flow marker: 12 zero address bytes and this ether-type.
const MARKER_ETHERTYPE: u16 = 0xfeed;

const ETH_DST: [u8; 6] = [0x11; 6];
const ETH_SRC: [u8; 6] = [0x22; 6];

/// Writes one TCP conversation into a pcap stream.
pub struct FlowWriter<W: Write> {
    pcap: PcapWriter<W>,
    cli: (Ipv4Addr, u16),
    srv: (Ipv4Addr, u16),
    cli_id: u16,
    srv_id: u16,
    cli_seq: u32,
    srv_seq: u32,
    last_ts: Duration,
    closed: bool,
}

impl<W: Write> FlowWriter<W> {
    /// Open the stream and emit the marker frame plus the handshake.
    ///
    /// The handshake is SYN, SYN|ACK only; the client's closing ACK is left
    /// out, so a replay completes setup with the first data segment.
    pub fn new(
        writer: W,
        cli: (Ipv4Addr, u16),
        srv: (Ipv4Addr, u16),
        ts: Duration,
    ) -> Result<Self> {
        let mut flow = FlowWriter {
            pcap: PcapWriter::new(writer)?,
            cli,
            srv,
            cli_id: 0,
            srv_id: 0,
            cli_seq: 1,
            srv_seq: 1,
            last_ts: Duration::ZERO,
            closed: false,
        };

        let mut marker = vec![0u8; 12];
        marker.extend_from_slice(&MARKER_ETHERTYPE.to_be_bytes());
        flow.write_raw(Duration::ZERO, &marker)?;

        flow.write_pkt(ts, true, &[], tcp_flags::SYN)?;
        flow.write_pkt(ts, false, &[], tcp_flags::SYN | tcp_flags::ACK)?;

        Ok(flow)
    }

    /// Append payload bytes from one side, split into segments of at most
    /// `0xff00` bytes, each carrying ACK.
    pub fn write(&mut self, ts: Duration, from_client: bool, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let (head, rest) = data.split_at(data.len().min(MAX_SEGMENT));
            self.write_pkt(ts, from_client, head, tcp_flags::ACK)?;
            data = rest;
        }
        Ok(())
    }

    /// FIN|ACK / FIN|ACK / ACK teardown at the last written timestamp.
    /// Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let ts = self.last_ts;
        self.write_pkt(ts, true, &[], tcp_flags::FIN | tcp_flags::ACK)?;
        self.write_pkt(ts, false, &[], tcp_flags::FIN | tcp_flags::ACK)?;
        self.write_pkt(ts, true, &[], tcp_flags::ACK)?;
        Ok(())
    }

    /// Close (if needed) and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        Ok(self.pcap.into_writer())
    }

    fn write_pkt(
        &mut self,
        ts: Duration,
        from_client: bool,
        payload: &[u8],
        flags: u8,
    ) -> Result<()> {
        let frame = self.build_frame(from_client, payload, flags);
        self.write_raw(ts, &frame)?;
        self.last_ts = ts;
        Ok(())
    }

    fn write_raw(&mut self, ts: Duration, bytes: &[u8]) -> Result<()> {
        self.pcap.write_packet(&PcapPacket {
            timestamp: ts,
            orig_len: bytes.len() as u32,
            data: Cow::Borrowed(bytes),
        })?;
        Ok(())
    }

    fn build_frame(&mut self, from_client: bool, payload: &[u8], flags: u8) -> Vec<u8> {
        let (sip, sport) = if from_client { self.cli } else { self.srv };
        let (dip, dport) = if from_client { self.srv } else { self.cli };

        let id;
        let seq;
        let mut ack;
        if from_client {
            id = self.cli_id;
            self.cli_id = self.cli_id.wrapping_add(1);
            seq = self.cli_seq;
            self.cli_seq = self.cli_seq.wrapping_add(payload.len() as u32);
            if flags & (tcp_flags::SYN | tcp_flags::FIN) != 0 {
                self.cli_seq = self.cli_seq.wrapping_add(1);
            }
            ack = self.srv_seq;
        } else {
            id = self.srv_id;
            self.srv_id = self.srv_id.wrapping_add(1);
            seq = self.srv_seq;
            self.srv_seq = self.srv_seq.wrapping_add(payload.len() as u32);
            if flags & (tcp_flags::SYN | tcp_flags::FIN) != 0 {
                self.srv_seq = self.srv_seq.wrapping_add(1);
            }
            ack = self.cli_seq;
        }
        if flags & tcp_flags::ACK == 0 {
            ack = 0;
        }

        let mut b = Vec::with_capacity(54 + payload.len());

        b.extend_from_slice(&ETH_DST);
        b.extend_from_slice(&ETH_SRC);
        b.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());

        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(40 + payload.len() as u16).to_be_bytes());
        ip[4..6].copy_from_slice(&id.to_be_bytes());
        ip[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF, offset 0
        ip[8] = 6; // TTL
        ip[9] = IPPROTO_TCP;
        ip[12..16].copy_from_slice(&sip.octets());
        ip[16..20].copy_from_slice(&dip.octets());
        let check = ipv4_checksum(&ip);
        ip[10..12].copy_from_slice(&check.to_be_bytes());
        b.extend_from_slice(&ip);

        b.extend_from_slice(&sport.to_be_bytes());
        b.extend_from_slice(&dport.to_be_bytes());
        b.extend_from_slice(&seq.to_be_bytes());
        b.extend_from_slice(&ack.to_be_bytes());
        b.push(0x50); // data offset 5, no options
        b.push(flags);
        b.extend_from_slice(&0xff00u16.to_be_bytes()); // window
        b.extend_from_slice(&[0, 0]); // checksum
        b.extend_from_slice(&[0, 0]); // urgent
        b.extend_from_slice(payload);

        b
    }
}

/// One's-complement sum of the ten header words, carry folded once.
fn ipv4_checksum(header: &[u8; 20]) -> u16 {
    let mut sum: u32 = 0;
    for w in header.chunks_exact(2) {
        sum += u32::from(u16::from_be_bytes([w[0], w[1]]));
    }
    !(((sum + (sum >> 16)) & 0xffff) as u16)
}
