mod common;

use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use common::{tcp_frame, CLI, SRV};
use muninn_lib::capture::SourcePos;
use muninn_lib::error::AnalysisError;
use muninn_lib::frame::tcp_flags::{ACK, PSH};
use muninn_lib::{Dissector, GapString, OpcodeTable, Packet, Session};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Toy protocol for the scaffold: `[opcode u8][len u8][len payload bytes]`.
struct ToyProto {
    table: OpcodeTable,
    seen: Vec<Packet>,
    finished: bool,
}

impl ToyProto {
    fn new() -> Self {
        let table = OpcodeTable::new()
            .with(1, "echo payload", |pkt| {
                let len = pkt.payload.as_ref().map(|p| p.len()).unwrap_or(0);
                pkt.set("len", len);
                Ok(())
            })
            .with(2, "goodbye", |_pkt| Ok(()));
        ToyProto { table, seen: Vec::new(), finished: false }
    }
}

impl Dissector for ToyProto {
    fn parse(&mut self, pkt: &mut Packet, data: GapString) -> Result<GapString, AnalysisError> {
        if data.len() < 2 {
            return Err(AnalysisError::NeedMoreData);
        }
        let hdr = data.slice(0..2).contiguous().ok_or(AnalysisError::NeedMoreData)?;
        let len = u64::from(hdr[1]);
        let total = 2 + len;
        if data.len() < total {
            return Err(AnalysisError::NeedMoreData);
        }

        pkt.opcode = Some(u64::from(hdr[0]));
        pkt.parts = vec![2, len];
        pkt.payload = Some(data.slice(2..total));
        Ok(data.slice(total..data.len()))
    }

    fn opcodes(&self) -> &OpcodeTable {
        &self.table
    }

    fn process(&mut self, pkt: Packet) {
        self.seen.push(pkt);
    }

    fn done(&mut self) {
        self.finished = true;
    }
}

fn pos() -> SourcePos {
    SourcePos { path: Rc::new(PathBuf::from("test.pcap")), offset: 24 }
}

fn gs(bytes: &[u8]) -> GapString {
    GapString::from_bytes(bytes.to_vec())
}

#[test]
fn partial_message_is_buffered_across_bursts() -> TestResult<()> {
    let transfers = tempfile::tempdir()?;
    let first = tcp_frame(0, CLI, SRV, 1001, 5001, PSH | ACK, b"\x01\x05hel");
    let mut session = Session::new(ToyProto::new(), first.clone(), transfers.path())?;

    // First burst ends mid-message: nothing processed, everything buffered.
    session.handle(false, Some(&first), gs(b"\x01\x05hel"), pos())?;
    assert!(session.dissector().seen.is_empty());

    // The rest arrives, plus a complete second message.
    session.handle(false, None, gs(b"lo\x02\x00"), pos())?;
    let seen = &session.dissector().seen;
    assert_eq!(seen.len(), 2);

    assert_eq!(seen[0].opcode, Some(1));
    assert_eq!(seen[0].opcode_desc, Some("echo payload"));
    assert_eq!(
        seen[0].payload.as_ref().and_then(|p| p.contiguous()).as_deref(),
        Some(b"hello".as_slice())
    );
    assert_eq!(seen[0].get("len"), Some("5"));

    assert_eq!(seen[1].opcode, Some(2));
    assert_eq!(seen[1].opcode_desc, Some("goodbye"));
    Ok(())
}

#[test]
fn directions_buffer_independently() -> TestResult<()> {
    let transfers = tempfile::tempdir()?;
    let req = tcp_frame(0, CLI, SRV, 1001, 5001, PSH | ACK, b"");
    let rsp = tcp_frame(1, SRV, CLI, 5001, 1004, PSH | ACK, b"");
    let mut session = Session::new(ToyProto::new(), req.clone(), transfers.path())?;

    // Half a client message, then a whole server message in between.
    session.handle(false, Some(&req), gs(b"\x01\x04ab"), pos())?;
    session.handle(true, Some(&rsp), gs(b"\x02\x00"), pos())?;
    assert_eq!(session.dissector().seen.len(), 1);
    assert_eq!(session.dissector().seen[0].opcode, Some(2));

    session.handle(false, None, gs(b"cd"), pos())?;
    assert_eq!(session.dissector().seen.len(), 2);
    assert_eq!(session.dissector().seen[1].opcode, Some(1));
    Ok(())
}

#[test]
fn unknown_opcode_surfaces() -> TestResult<()> {
    let transfers = tempfile::tempdir()?;
    let first = tcp_frame(0, CLI, SRV, 1001, 5001, PSH | ACK, b"");
    let mut session = Session::new(ToyProto::new(), first.clone(), transfers.path())?;

    let err = session
        .handle(false, Some(&first), gs(b"\x09\x00"), pos())
        .expect_err("opcode 9 has no handler");
    assert!(matches!(err, AnalysisError::UnknownOpcode(9)));
    Ok(())
}

#[test]
fn done_reaches_the_dissector() -> TestResult<()> {
    let transfers = tempfile::tempdir()?;
    let first = tcp_frame(0, CLI, SRV, 1001, 5001, PSH | ACK, b"");
    let mut session = Session::new(ToyProto::new(), first, transfers.path())?;
    session.done();
    assert!(session.dissector().finished);
    Ok(())
}

#[test]
fn open_out_links_both_endpoint_directories() -> TestResult<()> {
    let transfers = tempfile::tempdir()?;
    let first = tcp_frame(1_200_000, CLI, SRV, 1001, 5001, PSH | ACK, b"");
    let session = Session::new(ToyProto::new(), first, transfers.path())?;

    let mut fd = session.open_out("index of /~user.html")?;
    fd.write_all(b"contents")?;
    drop(fd);

    let name = "1200-10.0.0.1~1234-10.0.0.2~80---index%20of%20%2F%7Euser.html";
    let primary = transfers.path().join("10.0.0.1").join(name);
    let linked = transfers.path().join("10.0.0.2").join(name);
    assert_eq!(std::fs::read(&primary)?, b"contents");
    assert_eq!(std::fs::read(&linked)?, b"contents");
    Ok(())
}
