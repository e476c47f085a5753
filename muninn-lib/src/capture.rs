//! Capture file sources.
//!
//! A source is a pcap file, optionally with a resume offset:
//! `"trace.pcap"` or `"trace.pcap:::1048600"`. The offset points at a record
//! boundary where an earlier run stopped; the global header is always read
//! from the start of the file. Byte positions of unread records are tracked
//! so a consumer can print (or later resume from) exactly where it was.

use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io::{Chain, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use pcap_file::pcap::PcapReader;

use crate::error::{AnalysisError, Result};

const OFFSET_DELIM: &str = ":::";
const PCAP_HEADER_LEN: u64 = 24;

/// One raw capture record, still undecoded.
#[derive(Clone, Debug)]
pub struct RawRecord {
    /// Capture timestamp since the epoch.
    pub ts: Duration,
    /// Original wire length; `data` may be shorter if the snap length cut it.
    pub orig_len: u32,
    pub data: Bytes,
}

/// Byte position of the next unread record in a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcePos {
    pub path: Rc<PathBuf>,
    pub offset: u64,
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Printed in source-spec syntax so it can be fed back to resume.
        write!(f, "{}{}{}", self.path.display(), OFFSET_DELIM, self.offset)
    }
}

/// `Read` adapter counting consumed bytes, shared with the owning source.
struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

type SourceReader = PcapReader<CountingReader<Chain<Cursor<Vec<u8>>, File>>>;

pub struct CaptureSource {
    path: Rc<PathBuf>,
    reader: SourceReader,
    count: Rc<Cell<u64>>,
}

impl CaptureSource {
    /// Open `"<path>"` or `"<path>:::<byte_offset>"`.
    pub fn open(spec: &str) -> Result<CaptureSource> {
        let (path_str, offset) = match spec.split_once(OFFSET_DELIM) {
            Some((p, off)) => {
                let off = off.parse::<u64>().map_err(|_| {
                    AnalysisError::InvalidSource(format!("bad offset in {spec:?}"))
                })?;
                if off < PCAP_HEADER_LEN {
                    return Err(AnalysisError::InvalidSource(format!(
                        "offset {off} points inside the pcap header"
                    )));
                }
                (p, Some(off))
            }
            None => (spec, None),
        };

        let path = Rc::new(PathBuf::from(path_str));
        let mut file = File::open(path.as_ref())?;

        // The reader always needs the global header; with a resume offset the
        // record stream continues from there instead of byte 24.
        let mut header = vec![0u8; PCAP_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if let Some(off) = offset {
            file.seek(SeekFrom::Start(off))?;
        }

        let count = Rc::new(Cell::new(offset.unwrap_or(PCAP_HEADER_LEN) - PCAP_HEADER_LEN));
        let counting = CountingReader {
            inner: Cursor::new(header).chain(file),
            count: count.clone(),
        };
        let reader = PcapReader::new(counting)?;

        Ok(CaptureSource { path, reader, count })
    }

    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }

    /// Byte offset of the next unread record.
    pub fn position(&self) -> SourcePos {
        SourcePos { path: self.path.clone(), offset: self.count.get() }
    }

    /// Pull the next record. `None` at end of file; errors are sticky for
    /// the caller to retire the source.
    pub fn next_record(&mut self) -> Option<Result<RawRecord>> {
        match self.reader.next_packet()? {
            Ok(pkt) => Some(Ok(RawRecord {
                ts: pkt.timestamp,
                orig_len: pkt.orig_len,
                data: Bytes::copy_from_slice(&pkt.data),
            })),
            Err(e) => Some(Err(e.into())),
        }
    }
}
