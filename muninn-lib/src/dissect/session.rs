//! Per-flow dissection sessions.
//!
//! A `Session` sits between the resequencer and a [`Dissector`]: it buffers
//! partial messages per source address so a message split across two bursts
//! is parsed once, whole. It also owns the flow's output directory under the
//! transfers root.

use std::collections::HashMap;
use std::fs::{self, File};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ahash::RandomState;
use tracing::{info, warn};

use crate::capture::SourcePos;
use crate::dissect::packet::{Dissector, Packet};
use crate::error::{AnalysisError, Result};
use crate::frame::Frame;
use crate::gapstring::GapString;

pub struct Session<D: Dissector> {
    dissector: D,
    first_frame: Frame,
    last_frame: [Option<Frame>; 2],
    /// Partial messages keyed by sender address, merged across bursts.
    pending: HashMap<Ipv4Addr, (Frame, GapString), RandomState>,
    count: u64,
    lastpos: Option<SourcePos>,
    src_dir: PathBuf,
    dst_dir: PathBuf,
}

impl<D: Dissector> Session<D> {
    /// Create the session for a flow, rooting its output directories (one
    /// per endpoint address) under `transfers`.
    pub fn new(dissector: D, first_frame: Frame, transfers: impl Into<PathBuf>) -> Result<Self> {
        let transfers = transfers.into();
        let src = first_frame.src_addr().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let dst = first_frame.dst_addr().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let src_dir = transfers.join(src.to_string());
        let dst_dir = transfers.join(dst.to_string());
        for dir in [&src_dir, &dst_dir] {
            fs::create_dir_all(dir)?;
        }

        Ok(Session {
            dissector,
            first_frame,
            last_frame: [None, None],
            pending: HashMap::default(),
            count: 0,
            lastpos: None,
            src_dir,
            dst_dir,
        })
    }

    pub fn first_frame(&self) -> &Frame {
        &self.first_frame
    }

    /// Bursts handled so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn dissector(&self) -> &D {
        &self.dissector
    }

    pub fn dissector_mut(&mut self) -> &mut D {
        &mut self.dissector
    }

    /// Source position of the last burst, for "where was I" debugging.
    pub fn lastpos(&self) -> Option<&SourcePos> {
        self.lastpos.as_ref()
    }

    /// Handle one resequencer burst.
    ///
    /// `frame` is a frame of the burst, or `None` when it was all drops (the
    /// direction's previous frame stands in). `lastpos` is the source
    /// position of the burst, kept for debugging.
    pub fn handle(
        &mut self,
        is_srv: bool,
        frame: Option<&Frame>,
        gs: GapString,
        lastpos: SourcePos,
    ) -> Result<()> {
        let slot = usize::from(is_srv);
        if let Some(frame) = frame {
            self.last_frame[slot] = Some(frame.clone());
        }
        let Some(frame) = self.last_frame[slot].clone() else {
            warn!(at = %lastpos, "dropping burst with no frame ever seen for its direction");
            return Ok(());
        };
        self.lastpos = Some(lastpos);

        let Some(saddr) = frame.src_addr() else {
            return Ok(());
        };
        let (first, mut data) = self
            .pending
            .remove(&saddr)
            .unwrap_or_else(|| (frame.clone(), GapString::new()));
        data.extend(gs);

        while !data.is_empty() {
            let mut pkt = Packet::new(Some(first.clone()));
            match self.dissector.parse(&mut pkt, data.clone()) {
                Ok(rest) => {
                    self.dissector.opcodes().dispatch(&mut pkt)?;
                    self.dissector.process(pkt);
                    data = rest;
                }
                Err(AnalysisError::NeedMoreData) => {
                    // Re-buffer verbatim; the next burst may complete it.
                    self.pending.insert(saddr, (first, data));
                    self.count += 1;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        self.count += 1;
        Ok(())
    }

    /// All packets have been handled; tell the dissector.
    pub fn done(&mut self) {
        self.dissector.done();
    }

    /// Open an output file named after the flow, hard-linked into both
    /// endpoints' directories. The handle closes (and so releases) on drop.
    pub fn open_out(&self, name: &str) -> Result<File> {
        let frame = &self.first_frame;
        let (saddr, sport) = frame.src().unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
        let (daddr, dport) = frame.dst().unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
        let fname = format!(
            "{}-{}~{}-{}~{}---{}",
            frame.ts.as_secs(),
            saddr,
            sport,
            daddr,
            dport,
            quote(name),
        );

        let full = self.src_dir.join(&fname);
        let link = self.dst_dir.join(&fname);
        info!(file = %fname, "writing transfer");
        let fd = File::create(&full)?;
        if link != full {
            let _ = fs::remove_file(&link);
            fs::hard_link(&full, &link)?;
        }
        Ok(fd)
    }
}

/// Percent-encode everything but unreserved characters, uppercase hex.
fn quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' => out.push(b as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}
