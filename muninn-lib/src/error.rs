use thiserror::Error;

/// Errors that can occur while decoding and reassembling captures
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("malformed frame: need {needed} bytes at offset {offset}")]
    MalformedFrame { offset: usize, needed: usize },

    #[error("incomplete message, more data required")]
    NeedMoreData,

    #[error("opcode {0} unknown")]
    UnknownOpcode(u64),

    #[error("capture error: {0}")]
    Pcap(#[from] pcap_file::PcapError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid capture source: {0}")]
    InvalidSource(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
