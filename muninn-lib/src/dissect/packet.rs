//! Packet scaffold for reverse-engineering binary protocols.
//!
//! A `Packet` is one message pulled off a reassembled stream: an optional
//! opcode, named fields, leftover payload, possibly nested sub-messages.
//! Protocol knowledge lives in a [`Dissector`]: a parser that splits one
//! message off the front of a gap string, plus an [`OpcodeTable`] of
//! handlers. Start with [`RawDissector`] (everything is opaque payload) and
//! grow the table as the protocol gives up its secrets.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::error::{AnalysisError, Result};
use crate::frame::Frame;
use crate::gapstring::GapString;

/// One parsed protocol message.
#[derive(Clone, Debug)]
pub struct Packet {
    pub opcode: Option<u64>,
    /// Filled from the handler's description on dispatch.
    pub opcode_desc: Option<&'static str>,
    /// Lengths of the wire pieces this message was assembled from; by
    /// convention the last entry is the payload length.
    pub parts: Vec<u64>,
    pub params: BTreeMap<&'static str, String>,
    pub payload: Option<GapString>,
    pub subpackets: Vec<Packet>,
    /// The frame that began this message, when one was captured.
    pub first_frame: Option<Frame>,
}

impl Packet {
    pub fn new(first_frame: Option<Frame>) -> Self {
        Packet {
            opcode: None,
            opcode_desc: None,
            parts: Vec::new(),
            params: BTreeMap::new(),
            payload: None,
            subpackets: Vec::new(),
            first_frame,
        }
    }

    pub fn set(&mut self, key: &'static str, value: impl ToString) {
        self.params.insert(key, value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Human-readable dump: header, endpoints, parts, params, then
    /// sub-packets or a payload hexdump.
    pub fn show(&self) -> String {
        let mut out = String::new();

        let opcode = match self.opcode {
            Some(op) => op.to_string(),
            None => "-".to_string(),
        };
        let _ = writeln!(out, "packet {:>3}: {}", opcode, self.opcode_desc.unwrap_or(""));

        if let Some(frame) = &self.first_frame {
            if let (Some((saddr, sport)), Some((daddr, dport))) = (frame.src(), frame.dst()) {
                let when = DateTime::<Utc>::from_timestamp(frame.ts.as_secs() as i64, 0)
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "    {}:{} -> {}:{} ({}.{:06}Z)",
                    saddr,
                    sport,
                    daddr,
                    dport,
                    when.format("%Y-%m-%dT%H:%M:%S"),
                    frame.ts.subsec_micros(),
                );
            }
        }

        if let Some((&last, head)) = self.parts.split_last() {
            let cells: Vec<String> = head
                .iter()
                .map(|&x| if x == last { format!("{x:3}!") } else { format!("{x:3}") })
                .collect();
            let _ = writeln!(out, "           parts: ({}) +{} bytes", cells.join(","), last);
        }

        for (key, value) in &self.params {
            let _ = writeln!(out, "    {key:>12}: {value}");
        }

        if !self.subpackets.is_empty() {
            for sub in &self.subpackets {
                out.push_str(&sub.show());
            }
        } else if let Some(payload) = &self.payload {
            out.push_str(&payload.hexdump());
        }

        out
    }
}

pub type HandlerFn = fn(&mut Packet) -> Result<()>;

pub struct OpcodeHandler {
    /// One-line description; becomes `opcode_desc` on dispatch.
    pub desc: &'static str,
    pub run: HandlerFn,
}

/// Registered opcode handlers for one protocol.
#[derive(Default)]
pub struct OpcodeTable {
    handlers: BTreeMap<u64, OpcodeHandler>,
}

impl OpcodeTable {
    pub fn new() -> Self {
        OpcodeTable::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, opcode: u64, desc: &'static str, run: HandlerFn) -> Self {
        self.register(opcode, desc, run);
        self
    }

    pub fn register(&mut self, opcode: u64, desc: &'static str, run: HandlerFn) {
        self.handlers.insert(opcode, OpcodeHandler { desc, run });
    }

    pub fn get(&self, opcode: u64) -> Option<&OpcodeHandler> {
        self.handlers.get(&opcode)
    }

    /// Dispatch on `pkt.opcode`. A packet without an opcode passes through;
    /// an opcode nobody registered is an error.
    pub fn dispatch(&self, pkt: &mut Packet) -> Result<()> {
        let Some(opcode) = pkt.opcode else {
            return Ok(());
        };
        match self.handlers.get(&opcode) {
            Some(handler) => {
                if pkt.opcode_desc.is_none() {
                    pkt.opcode_desc = Some(handler.desc);
                }
                (handler.run)(pkt)
            }
            None => Err(AnalysisError::UnknownOpcode(opcode)),
        }
    }
}

/// Protocol knowledge: how to split messages, what the opcodes mean.
pub trait Dissector {
    /// Split one message off the front of `data`, filling `pkt`.
    ///
    /// Returns the remainder belonging to subsequent messages (empty when
    /// `data` was exactly one message). `Err(NeedMoreData)` means the prefix
    /// is incomplete: the caller re-buffers `data` untouched and retries
    /// after the next burst.
    fn parse(&mut self, pkt: &mut Packet, data: GapString) -> Result<GapString>;

    /// Opcode handlers for this protocol.
    fn opcodes(&self) -> &OpcodeTable;

    /// Called for every completed message. The default prints the dump,
    /// which is exactly what you want when staring at an unknown protocol.
    fn process(&mut self, pkt: Packet) {
        print!("{}", pkt.show());
    }

    /// Called once when the capture set is exhausted.
    fn done(&mut self) {}
}

/// The do-nothing dissector: every burst is one opaque message.
#[derive(Default)]
pub struct RawDissector {
    table: OpcodeTable,
}

impl RawDissector {
    pub fn new() -> Self {
        RawDissector::default()
    }
}

impl Dissector for RawDissector {
    fn parse(&mut self, pkt: &mut Packet, data: GapString) -> Result<GapString> {
        pkt.parts.push(data.len());
        pkt.payload = Some(data);
        Ok(GapString::new())
    }

    fn opcodes(&self) -> &OpcodeTable {
        &self.table
    }
}
