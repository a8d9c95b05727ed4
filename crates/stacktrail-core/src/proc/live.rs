//! Live-process provider: ptrace attachment, thread freeze, and memory
//! access through `process_vm_readv`.
//!
//! Every task of the target is attached individually so the whole thread
//! group is stopped while registers are read; dropping the target detaches
//! them all and the process resumes.

use std::fs;
use std::io::IoSliceMut;
use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::Thread;
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::types::{Machine, RegisterFile, ThreadId};

/// An attached live process. Exclusive: the kernel refuses a second tracer,
/// which we surface as [`Error::Busy`].
pub struct LiveTarget
{
    pid: Pid,
    tids: Vec<Pid>,
}

impl LiveTarget
{
    pub(super) fn attach(pid: u32) -> Result<Self>
    {
        let tids = discover_tasks(pid)?;
        if tids.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such process: {pid}"),
            )));
        }

        let mut attached = Vec::with_capacity(tids.len());
        for &tid in &tids {
            match ptrace::attach(tid).and_then(|()| waitpid(tid, Some(WaitPidFlag::__WALL)).map(|_| ())) {
                Ok(()) => attached.push(tid),
                Err(err) => {
                    for &tid in &attached {
                        let _ = ptrace::detach(tid, None);
                    }
                    return Err(map_attach_error(pid, err));
                }
            }
        }
        debug!("attached {} tasks of pid {pid}", attached.len());
        Ok(Self {
            pid: Pid::from_raw(pid as i32),
            tids: attached,
        })
    }

    /// Path of the target's executable, from `/proc/<pid>/exe`.
    pub(super) fn exec_path(&self) -> Option<PathBuf>
    {
        fs::read_link(format!("/proc/{}/exe", self.pid)).ok()
    }

    /// Register snapshots for every stopped task, in enumeration order.
    pub(super) fn threads(&self) -> Result<Vec<Thread>>
    {
        let mut threads = Vec::with_capacity(self.tids.len());
        for &tid in &self.tids {
            match capture_registers(tid) {
                Ok(regs) => threads.push(Thread {
                    tid: ThreadId(tid.as_raw() as u32),
                    regs,
                }),
                Err(err) => warn!("cannot read registers of task {tid}: {err}"),
            }
        }
        Ok(threads)
    }

    pub(super) fn reader(&self) -> Arc<dyn Reader>
    {
        Arc::new(LiveReader { pid: self.pid })
    }

    /// Lowest mapping of `path` in `/proc/<pid>/maps`; the image base of a
    /// position-independent executable.
    pub(super) fn image_base(&self, path: &str) -> Option<u64>
    {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid)).ok()?;
        maps.lines()
            .filter_map(|line| {
                // "start-end perms offset dev inode   pathname"
                let mut fields = line.split_whitespace();
                let range = fields.next()?;
                let name = fields.nth(4)?;
                if name != path {
                    return None;
                }
                let start = range.split('-').next()?;
                u64::from_str_radix(start, 16).ok()
            })
            .min()
    }
}

impl Drop for LiveTarget
{
    fn drop(&mut self)
    {
        for &tid in &self.tids {
            if let Err(err) = ptrace::detach(tid, None) {
                debug!("detach {tid} failed: {err}");
            }
        }
    }
}

fn discover_tasks(pid: u32) -> Result<Vec<Pid>>
{
    let entries = match fs::read_dir(format!("/proc/{pid}/task")) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(Pid::from_raw(tid));
        }
    }
    Ok(tids)
}

fn map_attach_error(pid: u32, err: Errno) -> Error
{
    match err {
        // The kernel refuses a second tracer; the process is someone
        // else's (or already ours).
        Errno::EPERM | Errno::EBUSY => Error::Busy(pid),
        Errno::ESRCH => Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such process: {pid}"),
        )),
        other => Error::Io(std::io::Error::from_raw_os_error(other as i32)),
    }
}

#[cfg(target_arch = "x86_64")]
fn capture_registers(tid: Pid) -> Result<RegisterFile>
{
    use gimli::Register;

    let user = ptrace::getregs(tid).map_err(|err| Error::Io(std::io::Error::from_raw_os_error(err as i32)))?;
    let mut regs = RegisterFile::new(Machine::X86_64);
    regs.set(Register(0), user.rax);
    regs.set(Register(1), user.rdx);
    regs.set(Register(2), user.rcx);
    regs.set(Register(3), user.rbx);
    regs.set(Register(4), user.rsi);
    regs.set(Register(5), user.rdi);
    regs.set(Register(6), user.rbp);
    regs.set(Register(7), user.rsp);
    regs.set(Register(8), user.r8);
    regs.set(Register(9), user.r9);
    regs.set(Register(10), user.r10);
    regs.set(Register(11), user.r11);
    regs.set(Register(12), user.r12);
    regs.set(Register(13), user.r13);
    regs.set(Register(14), user.r14);
    regs.set(Register(15), user.r15);
    regs.set_pc(user.rip);
    Ok(regs)
}

#[cfg(not(target_arch = "x86_64"))]
fn capture_registers(_tid: Pid) -> Result<RegisterFile>
{
    Err(Error::Unsupported(
        "live register capture is only implemented for x86-64".into(),
    ))
}

/// Address-space reader over an attached process.
struct LiveReader
{
    pid: Pid,
}

impl Reader for LiveReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        if dst.is_empty() {
            return Ok(0);
        }
        let remote = RemoteIoVec {
            base: offset as usize,
            len: dst.len(),
        };
        match process_vm_readv(self.pid, &mut [IoSliceMut::new(dst)], &[remote]) {
            Ok(got) => Ok(got),
            Err(Errno::EFAULT) => Err(Error::Unmapped(offset)),
            Err(Errno::ESRCH) => Err(Error::Detached),
            Err(err) => Err(Error::Io(std::io::Error::from_raw_os_error(err as i32))),
        }
    }

    fn describe(&self) -> String
    {
        format!("pid {}", self.pid)
    }
}
