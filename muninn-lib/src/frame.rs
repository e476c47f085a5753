//! Ethernet frame decoding.
//!
//! Turns one raw capture record into the pieces the rest of the crate cares
//! about: link-layer addresses, ARP or IPv4 headers, and for IPv4 the TCP,
//! UDP or ICMP transport header plus payload. Unsupported ether-types and IP
//! protocols keep their raw bytes so nothing is silently lost.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{AnalysisError, Result};

pub const ETHERTYPE_IP: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// TCP flag bits, low six bits of the flags octet.
pub mod tcp_flags {
    pub const FIN: u8 = 1;
    pub const SYN: u8 = 2;
    pub const RST: u8 = 4;
    pub const PSH: u8 = 8;
    pub const ACK: u8 = 16;
    pub const URG: u8 = 32;
}

/// A link-layer address, displayed `aa:bb:cc:dd:ee:ff`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// One decoded capture record.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Capture timestamp (seconds + fractional part since the epoch).
    pub ts: Duration,
    pub eth_dst: MacAddr,
    pub eth_src: MacAddr,
    /// Ether-type after any VLAN tag has been stripped.
    pub eth_type: u16,
    pub body: FrameBody,
}

#[derive(Clone, Debug)]
pub enum FrameBody {
    Arp(ArpFrame),
    Ipv4(Ipv4Frame),
    /// Unsupported ether-type; raw bytes after the Ethernet header.
    Other(Bytes),
}

#[derive(Clone, Debug)]
pub struct ArpFrame {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_len: u8,
    pub proto_len: u8,
    pub opcode: u16,
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct Ipv4Frame {
    pub tos: u8,
    pub tot_len: u16,
    pub id: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub transport: Transport,
}

#[derive(Clone, Debug)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    Icmp(IcmpMessage),
    /// Unknown IP protocol; payload preserved, ports absent.
    Other(Bytes),
}

#[derive(Clone, Debug)]
pub struct TcpSegment {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset in 32-bit words, straight from the header.
    pub data_off: u8,
    pub flags: u8,
    pub win: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Bytes,
    pub payload: Bytes,
}

#[derive(Clone, Debug)]
pub struct UdpDatagram {
    pub sport: u16,
    pub dport: u16,
    pub len: u16,
    pub checksum: u16,
    pub payload: Bytes,
}

#[derive(Clone, Debug)]
pub struct IcmpMessage {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub id: u16,
    pub seq: u16,
    pub payload: Bytes,
}

/// Big-endian cursor over a capture record. The unread tail is consumed with
/// slice operations (`split_to`) rather than index arithmetic. Header reads
/// past the captured bytes fail with `MalformedFrame`; payload reads clamp
/// instead, since a short snap length truncates payloads without
/// invalidating the headers.
struct Reader {
    /// Unread bytes.
    buf: Bytes,
    /// Bytes consumed so far; only used for error offsets.
    offset: usize,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Reader { buf, offset: 0 }
    }

    /// Split off the next `n` bytes, zero-copy.
    fn take(&mut self, n: usize) -> Result<Bytes> {
        if self.buf.len() < n {
            return Err(AnalysisError::MalformedFrame { offset: self.offset, needed: n });
        }
        let out = self.buf.split_to(n);
        self.offset += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let taken = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&taken);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        let [b] = self.array::<1>()?;
        Ok(b)
    }

    fn u16_be(&mut self) -> Result<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32_be(&mut self) -> Result<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn mac(&mut self) -> Result<MacAddr> {
        self.array().map(MacAddr)
    }

    fn ipv4(&mut self) -> Result<Ipv4Addr> {
        self.array().map(Ipv4Addr::from)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Take up to `n` bytes, clamped to what was captured.
    fn take_clamped(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        let out = self.buf.split_to(n);
        self.offset += n;
        out
    }

    fn rest(&mut self) -> Bytes {
        let n = self.buf.len();
        self.take_clamped(n)
    }
}

impl Frame {
    /// Decode one raw capture record.
    pub fn decode(ts: Duration, data: Bytes) -> Result<Frame> {
        let mut r = Reader::new(data);

        let eth_dst = r.mac()?;
        let eth_src = r.mac()?;
        let mut eth_type = r.u16_be()?;
        if eth_type == ETHERTYPE_VLAN {
            let _tci = r.u16_be()?;
            eth_type = r.u16_be()?;
        }

        let body = match eth_type {
            ETHERTYPE_ARP => FrameBody::Arp(decode_arp(&mut r)?),
            ETHERTYPE_IP => FrameBody::Ipv4(decode_ipv4(&mut r)?),
            _ => FrameBody::Other(r.rest()),
        };

        Ok(Frame { ts, eth_dst, eth_src, eth_type, body })
    }

    pub fn ipv4(&self) -> Option<&Ipv4Frame> {
        match &self.body {
            FrameBody::Ipv4(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpSegment> {
        match self.ipv4().map(|ip| &ip.transport) {
            Some(Transport::Tcp(tcp)) => Some(tcp),
            _ => None,
        }
    }

    /// Source endpoint of an IPv4 frame. Port is 0 when the transport has
    /// no ports (ICMP, unknown protocols).
    pub fn src(&self) -> Option<(Ipv4Addr, u16)> {
        self.ipv4().map(|ip| (ip.saddr, ip.transport.sport()))
    }

    pub fn dst(&self) -> Option<(Ipv4Addr, u16)> {
        self.ipv4().map(|ip| (ip.daddr, ip.transport.dport()))
    }

    /// Symmetric conversation key: both directions of a flow hash alike.
    ///
    /// XOR of addresses and ports as in the captures this tool grew up on.
    /// Distinct 4-tuples can collide; the unordered endpoint pair would be
    /// the collision-free alternative.
    pub fn flow_key(&self) -> Option<u32> {
        self.ipv4().map(|ip| {
            u32::from(ip.saddr)
                ^ u32::from(ip.transport.sport())
                ^ u32::from(ip.daddr)
                ^ u32::from(ip.transport.dport())
        })
    }

    /// Dotted-quad source address, for file names and logs.
    pub fn src_addr(&self) -> Option<Ipv4Addr> {
        match &self.body {
            FrameBody::Ipv4(ip) => Some(ip.saddr),
            FrameBody::Arp(arp) => Some(arp.sender_ip),
            FrameBody::Other(_) => None,
        }
    }

    pub fn dst_addr(&self) -> Option<Ipv4Addr> {
        match &self.body {
            FrameBody::Ipv4(ip) => Some(ip.daddr),
            FrameBody::Arp(arp) => Some(arp.target_ip),
            FrameBody::Other(_) => None,
        }
    }
}

impl Transport {
    pub fn sport(&self) -> u16 {
        match self {
            Transport::Tcp(t) => t.sport,
            Transport::Udp(u) => u.sport,
            _ => 0,
        }
    }

    pub fn dport(&self) -> u16 {
        match self {
            Transport::Tcp(t) => t.dport,
            Transport::Udp(u) => u.dport,
            _ => 0,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Transport::Tcp(t) => &t.payload,
            Transport::Udp(u) => &u.payload,
            Transport::Icmp(i) => &i.payload,
            Transport::Other(p) => p,
        }
    }
}

fn decode_arp(r: &mut Reader) -> Result<ArpFrame> {
    // Fixed Ethernet/IPv4 address sizes; hw_len/proto_len are recorded but
    // not used to size the fields, matching every capture we care about.
    Ok(ArpFrame {
        hw_type: r.u16_be()?,
        proto_type: r.u16_be()?,
        hw_len: r.u8()?,
        proto_len: r.u8()?,
        opcode: r.u16_be()?,
        sender_hw: r.mac()?,
        sender_ip: r.ipv4()?,
        target_hw: r.mac()?,
        target_ip: r.ipv4()?,
    })
}

fn decode_ipv4(r: &mut Reader) -> Result<Ipv4Frame> {
    let ihlvers = r.u8()?;
    let tos = r.u8()?;
    let tot_len = r.u16_be()?;
    let id = r.u16_be()?;
    let frag_off = r.u16_be()?;
    let ttl = r.u8()?;
    let protocol = r.u8()?;
    let checksum = r.u16_be()?;
    let saddr = r.ipv4()?;
    let daddr = r.ipv4()?;

    // IHL is read but options are discarded.
    let hdr_len = ((ihlvers & 0x0f) as usize * 4).max(20);
    r.skip(hdr_len - 20)?;

    // Transport bytes as advertised by the IP header; clamped to the
    // captured bytes further down.
    let ip_payload = (tot_len as usize).saturating_sub(hdr_len);

    let transport = match protocol {
        IPPROTO_TCP => Transport::Tcp(decode_tcp(r, ip_payload)?),
        IPPROTO_UDP => Transport::Udp(decode_udp(r)?),
        IPPROTO_ICMP => Transport::Icmp(decode_icmp(r, ip_payload)?),
        _ => Transport::Other(r.rest()),
    };

    Ok(Ipv4Frame {
        tos,
        tot_len,
        id,
        frag_off,
        ttl,
        protocol,
        checksum,
        saddr,
        daddr,
        transport,
    })
}

fn decode_tcp(r: &mut Reader, ip_payload: usize) -> Result<TcpSegment> {
    let sport = r.u16_be()?;
    let dport = r.u16_be()?;
    let seq = r.u32_be()?;
    let ack = r.u32_be()?;
    let x2off = r.u8()?;
    let flags = r.u8()?;
    let win = r.u16_be()?;
    let checksum = r.u16_be()?;
    let urgent = r.u16_be()?;

    let data_off = x2off >> 4;
    let hdr_len = (data_off as usize * 4).max(20);
    let options = r.take_clamped(hdr_len - 20);
    let payload = r.take_clamped(ip_payload.saturating_sub(hdr_len));

    Ok(TcpSegment {
        sport,
        dport,
        seq,
        ack,
        data_off,
        flags,
        win,
        checksum,
        urgent,
        options,
        payload,
    })
}

fn decode_udp(r: &mut Reader) -> Result<UdpDatagram> {
    let sport = r.u16_be()?;
    let dport = r.u16_be()?;
    let len = r.u16_be()?;
    let checksum = r.u16_be()?;
    let payload = r.take_clamped((len as usize).saturating_sub(8));

    Ok(UdpDatagram { sport, dport, len, checksum, payload })
}

fn decode_icmp(r: &mut Reader, ip_payload: usize) -> Result<IcmpMessage> {
    let icmp_type = r.u8()?;
    let code = r.u8()?;
    let checksum = r.u16_be()?;
    let id = r.u16_be()?;
    let seq = r.u16_be()?;
    let payload = r.take_clamped(ip_payload.saturating_sub(8));

    Ok(IcmpMessage { icmp_type, code, checksum, id, seq, payload })
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            FrameBody::Ipv4(ip) => match &ip.transport {
                Transport::Tcp(t) => write!(
                    f,
                    "<Frame TCP/IP {}:{}({:08x}) -> {}:{}({:08x}) length {}>",
                    ip.saddr, t.sport, t.seq, ip.daddr, t.dport, t.ack,
                    t.payload.len()
                ),
                Transport::Udp(u) => write!(
                    f,
                    "<Frame UDP/IP {}:{} -> {}:{} length {}>",
                    ip.saddr, u.sport, ip.daddr, u.dport,
                    u.payload.len()
                ),
                Transport::Icmp(i) => write!(
                    f,
                    "<Frame ICMP/IP {} -> {} type {} code {}>",
                    ip.saddr, ip.daddr, i.icmp_type, i.code
                ),
                Transport::Other(p) => write!(
                    f,
                    "<Frame IP protocol {} {} -> {} length {}>",
                    ip.protocol, ip.saddr, ip.daddr,
                    p.len()
                ),
            },
            FrameBody::Arp(arp) => write!(
                f,
                "<Frame ARP {}({}) -> {}({})>",
                arp.sender_hw, arp.sender_ip, arp.target_hw, arp.target_ip
            ),
            FrameBody::Other(p) => {
                write!(f, "<Frame ethertype {:#06x} length {}>", self.eth_type, p.len())
            }
        }
    }
}
