//! `stacktrail` — print per-thread stack traces of a live process or a
//! core image.
//!
//! ```text
//! stacktrail [EXECUTABLE] <CORE|PID>
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use stacktrail_core::{Process, ProcessOptions};
use stacktrail_utils::{init_logging_with_level, LogFormat, LogLevel};

#[derive(Parser)]
#[command(name = "stacktrail", version, about = "Print per-thread stack traces of a process or core image")]
struct Args
{
    /// Executable image, or the core/PID when only one positional is given
    #[arg(value_name = "EXECUTABLE|CORE|PID")]
    first: String,

    /// Core file or PID (when the executable was given)
    #[arg(value_name = "CORE|PID")]
    second: Option<String>,

    /// Show raw frame addresses alongside symbols
    #[arg(short = 's', long)]
    addresses: bool,

    /// Frame cap per thread
    #[arg(long, default_value_t = 4096)]
    max_frames: usize,

    /// Root under which .gnu_debuglink companions are searched
    #[arg(long, default_value = "/usr/lib/debug")]
    debug_prefix: PathBuf,

    /// Increase diagnostic output (-v debug, -vv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
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

    let (exec, target) = match &args.second {
        Some(second) => (Some(PathBuf::from(&args.first)), second.clone()),
        None => (None, args.first.clone()),
    };
    let options = ProcessOptions {
        debug_prefix: args.debug_prefix.clone(),
        max_frames: args.max_frames,
    };

    let mut process = open_target(&target, exec.as_deref(), options)?;
    process.load().context("loaded-object discovery failed")?;

    for thread in process.threads().to_vec() {
        println!("thread {}:", thread.tid);
        for (index, frame) in process.unwind(&thread).enumerate() {
            print_frame(index, &frame, args.addresses);
        }
        println!();
    }
    Ok(())
}

fn open_target(target: &str, exec: Option<&std::path::Path>, options: ProcessOptions) -> anyhow::Result<Process>
{
    if let Ok(pid) = target.parse::<u32>() {
        if std::path::Path::new(&format!("/proc/{pid}")).exists() {
            return Process::attach_with(pid, options).with_context(|| format!("cannot attach to pid {pid}"));
        }
    }
    Process::open_core_with(target, exec, options).with_context(|| format!("cannot open core {target}"))
}

fn print_frame(index: usize, frame: &stacktrail_core::Frame, addresses: bool)
{
    let mut line = format!("#{index:<3}");
    if addresses {
        line.push_str(&format!(" {:#018x}", frame.pc.value()));
    }
    match &frame.symbol {
        Some(resolved) => {
            match &resolved.name {
                Some(name) => line.push_str(&format!(" {} + {:#x}", name, resolved.offset)),
                None => line.push_str(" ??"),
            }
            line.push_str(&format!(" ({})", resolved.object));
            if let Some(location) = &resolved.location {
                match location.line {
                    Some(nr) => line.push_str(&format!(" at {}:{nr}", location.file)),
                    None => line.push_str(&format!(" at {}", location.file)),
                }
            }
        }
        None => line.push_str(&format!(" ?? ({:#x})", frame.pc.value())),
    }
    println!("{line}");
}
