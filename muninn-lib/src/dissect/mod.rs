mod packet;
mod session;

pub use packet::{Dissector, HandlerFn, OpcodeHandler, OpcodeTable, Packet, RawDissector};
pub use session::Session;
