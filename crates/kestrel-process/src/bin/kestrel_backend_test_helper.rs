//! Scripted stand-in for `kestrel-backend`, used by integration tests.
//!
//! Speaks the real wire protocol; flags select how it misbehaves.

use std::io::{self, BufReader, Write};
use std::{env, process, thread, time::Duration};

use kestrel_core::Candidate;
use kestrel_remote_proto::{
    read_message, write_message, BackendMessage, CompletionRequest, EngineVersion, Handshake,
};

#[derive(Default)]
struct Script {
    no_handshake: bool,
    protocol_version: Option<u32>,
    hang_on: Option<String>,
    exit_after: Option<usize>,
    garbage_after: Option<usize>,
}

fn parse_usize(value: Option<String>, flag: &str) -> usize {
    let value = value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    });
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid usize for {flag}: {value}");
        process::exit(2);
    })
}

fn parse_args() -> Script {
    let mut script = Script::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-handshake" => script.no_handshake = true,
            "--protocol-version" => {
                script.protocol_version = Some(parse_usize(args.next(), &arg) as u32)
            }
            "--hang-on" => script.hang_on = args.next(),
            "--exit-after" => script.exit_after = Some(parse_usize(args.next(), &arg)),
            "--garbage-after" => script.garbage_after = Some(parse_usize(args.next(), &arg)),
            // Flags the real backend accepts.
            "--interpreter" | "--log-file" | "--log-level" => {
                let _ = args.next();
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
    script
}

/// One candidate per fact the tests want to observe.
fn describe(request: &CompletionRequest, served: usize) -> Vec<Candidate> {
    vec![
        Candidate::new("pid", "statement").with_description(process::id().to_string()),
        Candidate::new("served", "statement").with_description(served.to_string()),
        Candidate::new("key", "statement").with_description(request.cache_key.to_string()),
        Candidate::new("pythonpath", "statement")
            .with_description(env::var("PYTHONPATH").unwrap_or_default()),
    ]
}

fn main() {
    let script = parse_args();
    let stdin = io::stdin();
    let mut input = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut output = stdout.lock();

    if script.no_handshake {
        thread::sleep(Duration::from_secs(600));
        return;
    }
    let mut handshake = Handshake::new(EngineVersion {
        name: "test-helper".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    });
    if let Some(version) = script.protocol_version {
        handshake.protocol_version = version;
    }
    if write_message(&mut output, &BackendMessage::Handshake(handshake)).is_err() {
        process::exit(1);
    }

    let mut served = 0usize;
    loop {
        let request: CompletionRequest = match read_message(&mut input) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                eprintln!("protocol error: {err}");
                process::exit(1);
            }
        };

        if script
            .hang_on
            .as_deref()
            .is_some_and(|needle| request.source.contains(needle))
        {
            thread::sleep(Duration::from_secs(600));
        }
        if script.garbage_after.is_some_and(|n| served >= n) {
            let _ = output.write_all(&[0xff, 0xff, 0xff, 0x7f, 1, 2, 3]);
            let _ = output.flush();
            thread::sleep(Duration::from_secs(600));
        }
        if script.exit_after.is_some_and(|n| served >= n) {
            process::exit(3);
        }

        served += 1;
        let response = BackendMessage::Completions(Some(describe(&request, served)));
        if write_message(&mut output, &response).is_err() {
            process::exit(1);
        }
    }
}
