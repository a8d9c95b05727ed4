//! `vtscan` — sweep a core image for pointers into vtable symbols and
//! report a live-object histogram per class.
//!
//! ```text
//! vtscan [-p PATTERN]... [-s] [-S STRING | -f START -e END] [EXECUTABLE] <CORE>
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use stacktrail_core::scan::{scan_vtables, ScanConfig};
use stacktrail_core::{Process, ProcessOptions};
use stacktrail_utils::{init_logging_with_level, LogFormat, LogLevel};
use tracing::info;

#[derive(Parser)]
#[command(name = "vtscan", version, about = "Count likely C++ instances in a core image by vtable pointer")]
struct Args
{
    /// Executable image, or the core when only one positional is given
    #[arg(value_name = "EXECUTABLE|CORE")]
    first: String,

    /// Core file (when the executable was given)
    #[arg(value_name = "CORE")]
    second: Option<String>,

    /// Symbol glob to count hits against (repeatable; default _ZTV*)
    #[arg(short = 'p', long = "pattern")]
    patterns: Vec<String>,

    /// Report words pointing into [START, END) instead of counting
    #[arg(short = 'f', long = "find-start", value_parser = parse_address)]
    find_start: Option<u64>,

    /// End of the reference-search range
    #[arg(short = 'e', long = "find-end", value_parser = parse_address, requires = "find_start")]
    find_end: Option<u64>,

    /// Search for a literal string instead of pointer sweeping
    #[arg(short = 'S', long = "string", conflicts_with = "find_start")]
    needle: Option<String>,

    /// Print the address of every individual hit
    #[arg(short = 's', long)]
    show_addresses: bool,

    /// Increase diagnostic output (-v debug, -vv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u64, String>
{
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("{s}: {err}"))
}

fn main() -> anyhow::Result<()>
{
    let args = Args::parse();
    let level = match args.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    if let Err(err) = init_logging_with_level(level, LogFormat::Pretty) {
        eprintln!("Failed to initialize logging: {err}");
    }

    let (exec, core) = match &args.second {
        Some(second) => (Some(PathBuf::from(&args.first)), second.clone()),
        None => (None, args.first.clone()),
    };

    let range = match (args.find_start, args.find_end) {
        (Some(start), Some(end)) => Some((start, end)),
        (Some(start), None) => Some((start, start)),
        (None, Some(_)) => bail!("-e needs -f"),
        (None, None) => None,
    };
    if let Some((start, end)) = range {
        info!("finding references to addresses from {start:#x} to {end:#x}");
    }

    let mut config = ScanConfig {
        needle: args.needle.as_ref().map(|s| s.as_bytes().to_vec()),
        range,
        show_addresses: args.show_addresses,
        ..ScanConfig::default()
    };
    if !args.patterns.is_empty() {
        config.patterns = args.patterns.clone();
    }

    let mut process =
        Process::open_core_with(&core, exec.as_deref(), ProcessOptions::default()).with_context(|| format!("cannot open core {core}"))?;
    process.load().context("loaded-object discovery failed")?;

    let report = scan_vtables(&process, &config)?;

    for hit in &report.needle_hits {
        println!("{hit:#x}");
    }
    for hit in &report.range_hits {
        println!("{hit:#x}");
    }
    for hit in &report.addresses {
        println!("{} + {:#x} {:#x}", hit.symbol, hit.offset, hit.location);
    }
    for row in &report.rows {
        println!("{} {} ( from {})", row.count, row.name, row.object);
    }
    Ok(())
}
