//! rscp - rcp/scp protocol endpoint
//!
//! Driven by a peer across stdin/stdout, conventionally via a remote
//! shell: `-f` emits the named trees, `-t` materializes the inbound
//! stream under the named target.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};

use rscp::limit::{BwStats, LimitedReader, LimitedWriter};
use rscp::logger::{Logger, NoopLogger, TextLogger};
use rscp::session::Session;
use rscp::sink::sink;
use rscp::source::source;
use rscp::SessionOpts;

#[derive(Parser, Debug)]
#[command(
    name = "rscp",
    version,
    about = "rcp/scp wire-protocol endpoint driven over stdin/stdout",
    group(ArgGroup::new("role").required(true))
)]
struct Args {
    /// Run in source mode
    #[arg(short = 'f', group = "role")]
    source: bool,

    /// Run in sink mode
    #[arg(short = 't', group = "role")]
    sink: bool,

    /// Copy directories recursively, following any symlinks
    #[arg(short = 'r')]
    recursive: bool,

    /// Preserve modification and access times and mode from original file
    #[arg(short = 'p')]
    preserve: bool,

    /// Target should be a directory
    #[arg(short = 'd')]
    target_dir: bool,

    /// Limit the bandwidth, specified in Kbit/s (0 disables)
    #[arg(short = 'l', value_name = "KBIT", default_value_t = 0)]
    limit: u64,

    /// Append a transfer log to FILE
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Print a transfer summary to stderr when done
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Files to send (source mode) or the single target (sink mode)
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "Usage: rscp -f [-pr] [-l limit] file1 ...\n       rscp -t [-prd] [-l limit] directory"
    );
    process::exit(2);
}

fn main() -> Result<()> {
    let args = Args::parse();

    let valid_argc =
        (args.source && !args.paths.is_empty()) || (args.sink && args.paths.len() == 1);
    if !valid_argc {
        usage();
    }

    let log: Box<dyn Logger> = match &args.log {
        Some(path) => Box::new(
            TextLogger::new(path).with_context(|| format!("open log {}", path.display()))?,
        ),
        None => Box::new(NoopLogger),
    };

    let opts = SessionOpts {
        recursive: args.recursive,
        preserve_attrs: args.preserve,
        target_dir: args.target_dir,
    };

    let (reader, writer): (Box<dyn Read>, Box<dyn Write>) = if args.limit > 0 {
        let stats = BwStats::shared(args.limit);
        (
            Box::new(LimitedReader::new(io::stdin(), stats.clone())),
            Box::new(LimitedWriter::new(io::stdout(), stats)),
        )
    } else {
        (Box::new(io::stdin()), Box::new(io::stdout()))
    };

    let mut sess = Session::new(reader, writer, opts, log);
    let start = Instant::now();

    let result = if args.source {
        sess.log.start("source");
        source(&mut sess, &args.paths)
    } else {
        sess.log.start("sink");
        sink(&mut sess, &args.paths[0], false)
    };

    let stats = sess.stats;
    let seconds = start.elapsed().as_secs_f64();
    sess.log.done(stats.files, stats.bytes, seconds);
    if args.verbose {
        eprintln!(
            "rscp: {} files, {} bytes in {:.3}s",
            stats.files, stats.bytes, seconds
        );
    }

    if let Err(err) = result {
        eprintln!("rscp: {err}");
        process::exit(1);
    }
    Ok(())
}
