//! Linux-specific shared memory, futex and process operations

use crate::error::{PipelineError, PipelineResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Exclusively create and map a region file of `size` bytes.
///
/// Returns `Ok(None)` if the file already exists; the caller is then not the
/// creator and should attach instead. The new file is zero-filled.
pub fn create_region_mmap(path: &Path, size: usize) -> PipelineResult<Option<MmapMut>> {
    let file = match OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(PipelineError::ResourceExhausted {
                reason: format!("create {}: {e}", path.display()),
            });
        }
    };

    match size_and_map(&file, size) {
        Ok(mmap) => Ok(Some(mmap)),
        Err(reason) => {
            // Leave no half-sized region behind for attachers to find.
            let _ = std::fs::remove_file(path);
            Err(PipelineError::ResourceExhausted {
                reason: format!("{}: {reason}", path.display()),
            })
        }
    }
}

fn size_and_map(file: &File, size: usize) -> Result<MmapMut, std::io::Error> {
    file.set_len(size as u64)?;
    // SAFETY: the file was just created by this process with the exact size
    // mapped here; other participants only ever access it through the same
    // layout.
    unsafe { MmapOptions::new().len(size).map_mut(file) }
}

/// Open an existing region file and report its current length.
pub fn open_region_file(path: &Path, name: &str) -> PipelineResult<(File, u64)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => PipelineError::NotFound {
                name: name.to_string(),
            },
            _ => PipelineError::Io { source: e },
        })?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// Map `len` bytes of an already-open region file.
pub fn map_region_file(file: &File, len: usize) -> PipelineResult<MmapMut> {
    // SAFETY: the region file is only resized by its creator before the
    // header is published; `len` never exceeds the length observed after
    // that point.
    unsafe { MmapOptions::new().len(len).map_mut(file) }.map_err(|e| {
        PipelineError::ResourceExhausted {
            reason: format!("map {len} bytes: {e}"),
        }
    })
}

/// Map a zero-filled anonymous region visible to this process only.
pub fn anonymous_mmap(size: usize) -> PipelineResult<MmapMut> {
    MmapMut::map_anon(size).map_err(|e| PipelineError::ResourceExhausted {
        reason: format!("anonymous map of {size} bytes: {e}"),
    })
}

/// Sleep while `word` still holds `expected`.
///
/// Uses a non-private futex so waiters in other processes mapping the same
/// file are woken too. Returns `false` only when `timeout` elapsed; spurious
/// wakeups and value changes return `true` and the caller re-checks.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: `word` is a live, aligned u32 for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    !(rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ETIMEDOUT))
}

/// Wake up to `count` waiters sleeping on `word`.
pub fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: `word` is a live, aligned u32 for the duration of the call.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }

    // A null signal tests for existence without delivering anything
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true, // Exists but owned by someone else
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
