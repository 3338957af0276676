//! # CLI - lsmkv interactive shell
//!
//! A REPL-style front end for the storage engine. Reads commands from stdin,
//! executes them against the engine, and prints results to stdout. Works
//! interactively and with piped scripts. Logs go to stderr.
//!
//! ## Commands
//!
//! ```text
//! PUT key value          Insert or update a key (value may contain spaces)
//! GET key                Look up a key (prints value or "(nil)")
//! DEL key                Delete a key (writes a tombstone)
//! MPUT k1=v1 k2=v2 ..    Write several keys as one batch
//! MGET k1 k2 ..          Look up several keys
//! RANGE start end        Inclusive range read
//! FLUSH                  Write memtables out as segments
//! COMPACT                Merge every segment into one run
//! STATS                  Print engine counters
//! EXIT / QUIT            Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! Engine settings come from `LSMKV_*` environment variables (see the
//! `config` crate); `RUST_LOG` controls log verbosity (default `info`).
//!
//! ## Example
//!
//! ```text
//! $ LSMKV_DATA_DIR=/tmp/kv cargo run -p cli
//! lsmkv started (dir=/tmp/kv, last_seq=0)
//! > PUT name Alice
//! OK
//! > GET name
//! Alice
//! > RANGE a z
//! name -> Alice
//! (1 entries)
//! > EXIT
//! bye
//! ```

use anyhow::{Context, Result};
use config::EngineConfig;
use engine::{EngineStats, StorageEngine};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const HELP: &str = "Commands: PUT key value | GET key | DEL key | MPUT k=v .. | MGET k ..
          RANGE start end | FLUSH | COMPACT | STATS | EXIT";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();

    let config = EngineConfig::from_env().context("invalid LSMKV_* configuration")?;
    let engine = StorageEngine::open(config).context("failed to start storage engine")?;

    println!(
        "lsmkv started (dir={}, last_seq={})",
        engine.data_dir().display(),
        engine.stats().last_seq
    );
    println!("{HELP}");
    prompt();

    for line in io::stdin().lock().lines() {
        let line = line?;
        match execute(&engine, &line) {
            Some(reply) if reply.is_empty() => {}
            Some(reply) => println!("{reply}"),
            None => {
                println!("bye");
                break;
            }
        }
        prompt();
    }

    engine.close().context("shutdown failed")?;
    info!("shell exited");
    Ok(())
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}

/// Runs one command line. Returns the text to print, or `None` on exit.
fn execute(engine: &StorageEngine, line: &str) -> Option<String> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let reply = match cmd.to_ascii_uppercase().as_str() {
        "" => String::new(),
        "PUT" => match rest.split_once(char::is_whitespace) {
            Some((key, value)) => ok_or_err(engine.put(key, value.trim_start())),
            None => "ERR usage: PUT key value".to_string(),
        },
        "GET" => match args.as_slice() {
            [key] => match engine.get(key) {
                Ok(Some(v)) => String::from_utf8_lossy(&v).into_owned(),
                Ok(None) => "(nil)".to_string(),
                Err(e) => err(&e),
            },
            _ => "ERR usage: GET key".to_string(),
        },
        "DEL" => match args.as_slice() {
            [key] => ok_or_err(engine.delete(key)),
            _ => "ERR usage: DEL key".to_string(),
        },
        "MPUT" => mput(engine, &args),
        "MGET" => {
            if args.is_empty() {
                "ERR usage: MGET key [key ..]".to_string()
            } else {
                match engine.get_batch(&args) {
                    Ok(found) => format_batch(&found),
                    Err(e) => err(&e),
                }
            }
        }
        "RANGE" => match args.as_slice() {
            [start, end] => match engine.get_range(start, end) {
                Ok(entries) => format_range(&entries),
                Err(e) => err(&e),
            },
            _ => "ERR usage: RANGE start end".to_string(),
        },
        "FLUSH" => ok_or_err(engine.flush()),
        "COMPACT" => ok_or_err(engine.compact()),
        "STATS" => format_stats(&engine.stats()),
        "HELP" => HELP.to_string(),
        "EXIT" | "QUIT" => return None,
        other => format!("ERR unknown command: {other}"),
    };
    Some(reply)
}

fn mput(engine: &StorageEngine, args: &[&str]) -> String {
    if args.is_empty() {
        return "ERR usage: MPUT key=value [key=value ..]".to_string();
    }
    let mut pairs = Vec::with_capacity(args.len());
    for arg in args {
        match arg.split_once('=') {
            Some(pair) => pairs.push(pair),
            None => return format!("ERR malformed entry {arg:?} (expected key=value)"),
        }
    }
    ok_or_err(engine.put_batch(pairs))
}

fn ok_or_err(result: Result<(), engine::EngineError>) -> String {
    match result {
        Ok(()) => "OK".to_string(),
        Err(e) => err(&e),
    }
}

fn err(e: &engine::EngineError) -> String {
    debug!(error = ?e, "command failed");
    format!("ERR {e}")
}

fn format_batch(found: &BTreeMap<Vec<u8>, Option<Vec<u8>>>) -> String {
    found
        .iter()
        .map(|(k, v)| {
            let value = v
                .as_ref()
                .map_or_else(|| "(nil)".into(), |v| String::from_utf8_lossy(v));
            format!("{} -> {}", String::from_utf8_lossy(k), value)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_range(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> String {
    if entries.is_empty() {
        return "(empty)".to_string();
    }
    let mut out: Vec<String> = entries
        .iter()
        .map(|(k, v)| {
            format!("{} -> {}", String::from_utf8_lossy(k), String::from_utf8_lossy(v))
        })
        .collect();
    out.push(format!("({} entries)", entries.len()));
    out.join("\n")
}

fn format_stats(stats: &EngineStats) -> String {
    let tiers = stats
        .segments_per_tier
        .iter()
        .map(|(tier, n)| format!("T{tier}:{n}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "last_seq={} memtable_bytes={} memtable_entries={} frozen={} segments={} [{}] queued={}",
        stats.last_seq,
        stats.active_memtable_bytes,
        stats.active_memtable_entries,
        stats.frozen_memtables,
        stats.segment_count(),
        tiers,
        stats.queued_writes
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::FsyncPolicy;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> StorageEngine {
        StorageEngine::open(EngineConfig::new(dir).fsync_policy(FsyncPolicy::Always)).unwrap()
    }

    fn run(engine: &StorageEngine, line: &str) -> String {
        execute(engine, line).unwrap()
    }

    #[test]
    fn put_get_del() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());

        assert_eq!(run(&e, "PUT greeting hello world"), "OK");
        assert_eq!(run(&e, "get greeting"), "hello world");
        assert_eq!(run(&e, "DEL greeting"), "OK");
        assert_eq!(run(&e, "GET greeting"), "(nil)");
    }

    #[test]
    fn batch_commands() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());

        assert_eq!(run(&e, "MPUT a=1 b=2 c="), "OK");
        assert_eq!(run(&e, "MGET a c zz"), "a -> 1\nc -> \nzz -> (nil)");
        assert!(run(&e, "MPUT a=1 broken").starts_with("ERR malformed entry"));
        assert_eq!(run(&e, "RANGE a b"), "a -> 1\nb -> 2\n(2 entries)");
        assert_eq!(run(&e, "RANGE x y"), "(empty)");
    }

    #[test]
    fn errors_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());

        assert_eq!(run(&e, "GET"), "ERR usage: GET key");
        assert_eq!(run(&e, "PUT lonely"), "ERR usage: PUT key value");
        assert!(run(&e, "RANGE z a").starts_with("ERR invalid key range"));
        assert_eq!(run(&e, "FROB"), "ERR unknown command: FROB");
        assert_eq!(run(&e, ""), "");
        assert!(execute(&e, "quit").is_none());
    }

    #[test]
    fn flush_compact_stats() {
        let dir = tempdir().unwrap();
        let e = engine(dir.path());

        run(&e, "PUT k v1");
        assert_eq!(run(&e, "FLUSH"), "OK");
        run(&e, "PUT k v2");
        assert_eq!(run(&e, "FLUSH"), "OK");
        assert!(run(&e, "STATS").contains("segments=2"));
        assert_eq!(run(&e, "COMPACT"), "OK");
        assert!(run(&e, "STATS").contains("segments=1"));
        assert_eq!(run(&e, "GET k"), "v2");
    }
}
