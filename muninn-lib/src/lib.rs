#![forbid(unsafe_code)]

pub mod capture;
pub mod dispatch;
pub mod dissect;
pub mod error;
pub mod frame;
pub mod gapstring;
pub mod hexdump;
pub mod reseq;
pub mod synth;

pub use capture::{CaptureSource, RawRecord, SourcePos};
pub use dispatch::Dispatch;
pub use dissect::{Dissector, OpcodeTable, Packet, RawDissector, Session};
pub use error::{AnalysisError, Result};
pub use frame::{Frame, FrameBody, MacAddr, TcpSegment, Transport};
pub use gapstring::GapString;
pub use reseq::{Direction, Emission, TcpResequencer};
pub use synth::FlowWriter;
