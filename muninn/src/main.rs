#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use muninn_lib::{Dispatch, RawDissector, Session};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay TCP conversations out of packet captures")]
struct Cli {
    /// Capture files; "<path>" or "<path>:::<byte_offset>" to resume
    #[arg(required = true, value_name = "CAPTURE")]
    sources: Vec<String>,

    /// Directory for extracted transfers
    #[arg(long, env = "TRANSFERS", default_value = "transfers", value_name = "DIR")]
    transfers: PathBuf,
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let mut dispatch = match Dispatch::with_sources(cli.sources.iter().map(String::as_str)) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            error!(%err, "failed to open capture sources");
            return ExitCode::FAILURE;
        }
    };
    info!(sources = cli.sources.len(), "capture sources opened");

    let mut sessions: HashMap<u32, Session<RawDissector>> = HashMap::new();
    while let Some((key, emission, pos)) = dispatch.next_chunk() {
        let key_hex = format!("{key:08x}");
        if !sessions.contains_key(&key) {
            let first = emission
                .first
                .clone()
                .or_else(|| dispatch.flow(key).and_then(|f| f.first_frame().cloned()));
            let Some(first) = first else { continue };
            match Session::new(RawDissector::new(), first, &cli.transfers) {
                Ok(session) => {
                    sessions.insert(key, session);
                }
                Err(err) => {
                    warn!(key = %key_hex, %err, "failed to set up session");
                    continue;
                }
            }
        }

        if let Some(session) = sessions.get_mut(&key) {
            info!(
                key = %key_hex,
                dir = %emission.dir,
                bytes = emission.data.len(),
                missing = emission.data.missing(),
                "chunk"
            );
            if let Err(err) = session.handle(
                emission.dir.is_server(),
                emission.first.as_ref(),
                emission.data,
                pos,
            ) {
                warn!(key = %key_hex, %err, "session error, dropping flow");
                sessions.remove(&key);
                continue;
            }
        }

        if dispatch.flow_closed(key) {
            if let Some(mut session) = sessions.remove(&key) {
                session.done();
            }
        }
    }

    for (_, mut session) in sessions {
        session.done();
    }
    ExitCode::SUCCESS
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
