//! Per-flow TCP resequencing.
//!
//! One `TcpResequencer` per conversation. Frames arrive in capture order;
//! whenever a frame's ACK advances the delivered high-water mark for the
//! opposite direction, the buffered segments of that direction are bundled
//! into a single gap-aware chunk and emitted. The result replays the
//! conversation as the ACKing endpoint perceived it: each side's bytes in
//! sequence order, direction changes in wire ACK order.
//!
//! Out-of-order segments and retransmits are absorbed; dropped segments
//! become gaps, never errors. 32-bit sequence wraparound is not handled: a
//! flow that crosses 2^32 will mis-sort its pending buffer.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::frame::{tcp_flags, Frame};
use crate::gapstring::GapString;
use crate::hexdump::hexdump;

/// Gaps above this many bytes are worth a log line.
const LARGE_GAP: u32 = 6000;

/// Which endpoint a chunk of bytes came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

impl Direction {
    pub fn from_index(idx: usize) -> Direction {
        if idx == 0 {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Slot in the per-direction state arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub fn is_server(self) -> bool {
        self == Direction::ServerToClient
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client->server"),
            Direction::ServerToClient => f.write_str("server->client"),
        }
    }
}

/// One bundle of newly delivered bytes for one direction.
#[derive(Clone, Debug)]
pub struct Emission {
    pub dir: Direction,
    /// Earliest frame that contributed, `None` when the bundle is all drops.
    pub first: Option<Frame>,
    pub data: GapString,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Handshake,
    Established,
    Drop,
}

/// TCP session resequencer.
///
/// Feed every TCP frame of one flow to [`handle`](Self::handle) in capture
/// order; emissions come back in conversation order.
pub struct TcpResequencer {
    state: State,
    cli: Option<(Ipv4Addr, u16)>,
    srv: Option<(Ipv4Addr, u16)>,
    /// Per direction: highest sequence number already committed to output.
    lastack: [u32; 2],
    /// Per direction: buffered frames keyed by sequence number.
    pending: [BTreeMap<u32, Frame>; 2],
    closed: [bool; 2],
    midstream: bool,
    first: Option<Frame>,
}

impl TcpResequencer {
    pub fn new() -> Self {
        TcpResequencer {
            state: State::Handshake,
            cli: None,
            srv: None,
            lastack: [0, 0],
            pending: [BTreeMap::new(), BTreeMap::new()],
            closed: [false, false],
            midstream: false,
            first: None,
        }
    }

    /// The flow started without a complete three-way handshake.
    pub fn midstream(&self) -> bool {
        self.midstream
    }

    /// Both directions have seen FIN (or the flow was reset).
    pub fn is_closed(&self) -> bool {
        self.closed == [true, true]
    }

    pub fn client(&self) -> Option<(Ipv4Addr, u16)> {
        self.cli
    }

    pub fn server(&self) -> Option<(Ipv4Addr, u16)> {
        self.srv
    }

    pub fn first_frame(&self) -> Option<&Frame> {
        self.first.as_ref()
    }

    /// Ingest one frame; returns a bundle when an ACK advanced the opposite
    /// direction's delivered high-water mark. Non-TCP frames are ignored.
    pub fn handle(&mut self, frame: &Frame) -> Option<Emission> {
        frame.tcp()?;
        match self.state {
            State::Handshake => self.handle_handshake(frame),
            State::Established => self.handle_packet(frame),
            State::Drop => self.handle_drop(frame),
        }
    }

    fn handle_handshake(&mut self, frame: &Frame) -> Option<Emission> {
        let tcp = frame.tcp()?;
        let opens_flow = self.first.is_none();
        if opens_flow {
            self.first = Some(frame.clone());
        }

        if tcp.flags == tcp_flags::SYN {
            self.cli = frame.src();
            self.srv = frame.dst();
            None
        } else if tcp.flags == (tcp_flags::SYN | tcp_flags::ACK) {
            self.cli = frame.dst();
            self.srv = frame.src();
            self.lastack = [tcp.seq.wrapping_add(1), tcp.ack];
            // Processed as established, but the state stays Handshake: the
            // peer's bare ACK (or first data segment) completes the setup.
            self.handle_packet(frame)
        } else if tcp.flags == tcp_flags::ACK {
            if opens_flow {
                // A bare ACK opening the capture never had a handshake.
                warn!(frame = %frame, "starting mid-stream");
                self.midstream = true;
            }
            self.cli = frame.src();
            self.srv = frame.dst();
            self.lastack = [tcp.ack, tcp.seq];
            self.state = State::Established;
            self.handle_packet(frame)
        } else {
            // In the middle of a session, do the best we can.
            warn!(frame = %frame, "starting mid-stream");
            self.midstream = true;
            self.cli = frame.src();
            self.srv = frame.dst();
            self.lastack = [tcp.ack, tcp.seq];
            self.state = State::Established;
            self.handle_packet(frame)
        }
    }

    fn handle_packet(&mut self, frame: &Frame) -> Option<Emission> {
        let tcp = frame.tcp()?;
        let idx = if frame.src() == self.srv { 1 } else { 0 };
        let xdi = 1 - idx;

        if tcp.flags & tcp_flags::RST != 0 {
            // Flush before wonky sequence numbers can confuse the bundle.
            self.closed = [true, true];
            self.state = State::Drop;
            return Some(self.bundle_pending(xdi, tcp.ack, self.lastack[idx]));
        }

        self.pending[idx].insert(tcp.seq, frame.clone());

        let seq = self.lastack[idx];
        self.lastack[idx] = tcp.ack;
        if tcp.ack > seq {
            Some(self.bundle_pending(xdi, tcp.ack, seq))
        } else {
            None
        }
    }

    fn handle_drop(&mut self, frame: &Frame) -> Option<Emission> {
        let tcp = frame.tcp()?;

        if tcp.flags & tcp_flags::SYN != 0 {
            // Port reuse: same endpoints, fresh conversation.
            *self = TcpResequencer::new();
            return self.handle(frame);
        }

        if !tcp.payload.is_empty() {
            warn!(frame = %frame, flags = tcp.flags, "spurious frame after shutdown");
            debug!("spurious payload:\n{}", hexdump(&tcp.payload));
        }
        None
    }

    /// Bundle buffered frames of direction `xdi` into one emission, covering
    /// sequence numbers `[seq, ack_bound)`.
    fn bundle_pending(&mut self, xdi: usize, ack_bound: u32, mut seq: u32) -> Emission {
        let pending = &mut self.pending[xdi];

        let first = pending
            .first_key_value()
            .map(|(_, frame)| frame.clone());

        let keys: Vec<u32> = pending.keys().copied().collect();
        let mut gs = GapString::new();
        let mut dir_closed = self.closed[xdi];

        for key in keys {
            if key >= ack_bound {
                // In the future; a later ACK will claim it.
                break;
            }
            let Some(frame) = pending.remove(&key) else { continue };
            let Some(tcp) = frame.tcp() else { continue };

            if key > seq {
                // Dropped frame(s).
                let gap = key - seq;
                if gap > LARGE_GAP {
                    warn!(gap, "large gap in stream");
                }
                gs.push_gap(u64::from(gap));
                seq = key;
            }
            if key == seq {
                gs.push_bytes(tcp.payload.clone());
                seq = seq.wrapping_add(tcp.payload.len() as u32);
            }
            // key < seq is a retransmit of data already claimed; nothing to
            // append, the frame is simply dropped from pending.

            if tcp.flags & tcp_flags::FIN != 0 {
                seq = seq.wrapping_add(1);
            }
            if tcp.flags & (tcp_flags::FIN | tcp_flags::ACK)
                == (tcp_flags::FIN | tcp_flags::ACK)
            {
                dir_closed = true;
            }
        }

        self.closed[xdi] = dir_closed;
        if self.closed == [true, true] {
            self.state = State::Drop;
        }

        if seq < ack_bound {
            // Drop at the end.
            let gap = ack_bound - seq;
            if gap > LARGE_GAP {
                warn!(gap, ack = ack_bound, seq, "large drop at end of session");
            }
            gs.push_gap(u64::from(gap));
        }

        Emission { dir: Direction::from_index(xdi), first, data: gs }
    }
}

impl Default for TcpResequencer {
    fn default() -> Self {
        Self::new()
    }
}
