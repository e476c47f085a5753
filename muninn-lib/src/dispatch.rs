//! Timestamp-ordered merge of capture sources.
//!
//! Any number of pcap files are merged into one stream, strictly
//! non-decreasing by capture timestamp (ties stable by source order), and
//! every TCP frame is routed to its flow's resequencer. The dispatcher owns
//! the sources, the heap and the flow table; it is exhausted when every
//! source is.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use ahash::RandomState;
use tracing::{debug, warn};

use crate::capture::{CaptureSource, RawRecord, SourcePos};
use crate::error::Result;
use crate::frame::Frame;
use crate::reseq::{Emission, TcpResequencer};

struct HeapEntry {
    ts: Duration,
    src: usize,
    pos: SourcePos,
    record: RawRecord,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.src == other.src
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts.cmp(&other.ts).then(self.src.cmp(&other.src))
    }
}

#[derive(Default)]
pub struct Dispatch {
    sources: Vec<CaptureSource>,
    flows: HashMap<u32, TcpResequencer, RandomState>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Position of the oldest record not yet part of an emission.
    last: Option<SourcePos>,
}

impl Dispatch {
    pub fn new() -> Self {
        Dispatch::default()
    }

    pub fn with_sources<I, S>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dispatch = Dispatch::new();
        for spec in specs {
            dispatch.open(spec.as_ref())?;
        }
        Ok(dispatch)
    }

    /// Add a capture source (`"<path>"` or `"<path>:::<offset>"`).
    pub fn open(&mut self, spec: &str) -> Result<()> {
        let source = CaptureSource::open(spec)?;
        let idx = self.sources.len();
        self.sources.push(source);
        self.refill(idx);
        Ok(())
    }

    /// Read the next record of source `idx` onto the heap. A source that
    /// errors is retired; the merge goes on without it.
    fn refill(&mut self, idx: usize) {
        let source = &mut self.sources[idx];
        let pos = source.position();
        match source.next_record() {
            Some(Ok(record)) => {
                self.heap.push(Reverse(HeapEntry { ts: record.ts, src: idx, pos, record }));
            }
            Some(Err(e)) => {
                warn!(
                    source = %source.path().display(),
                    error = %e,
                    "capture source failed, retiring it"
                );
            }
            None => {}
        }
    }

    /// Next resequencer emission across all sources, with the flow key and
    /// the source position of the oldest record it covers.
    pub fn next_chunk(&mut self) -> Option<(u32, Emission, SourcePos)> {
        loop {
            let Reverse(entry) = self.heap.pop()?;
            let HeapEntry { src, pos, record, .. } = entry;
            if self.last.is_none() {
                self.last = Some(pos.clone());
            }
            self.refill(src);

            let frame = match Frame::decode(record.ts, record.data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(at = %pos, error = %e, "skipping malformed frame");
                    continue;
                }
            };

            if frame.tcp().is_none() {
                // Decoded for the caller's benefit only; this layer routes TCP.
                debug!(frame = %frame, "non-TCP frame");
                continue;
            }
            let Some(key) = frame.flow_key() else { continue };

            let flow = self.flows.entry(key).or_default();
            if let Some(emission) = flow.handle(&frame) {
                let chunk_pos = self.last.take().unwrap_or(pos);
                return Some((key, emission, chunk_pos));
            }
        }
    }

    pub fn flow(&self, key: u32) -> Option<&TcpResequencer> {
        self.flows.get(&key)
    }

    /// Both directions of the flow have shut down.
    pub fn flow_closed(&self, key: u32) -> bool {
        self.flow(key).is_some_and(TcpResequencer::is_closed)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

impl Iterator for Dispatch {
    type Item = (u32, Emission, SourcePos);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}
