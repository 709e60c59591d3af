// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPC wake primitives.
//!
//! All variants share the same semantics: `post` unparks the worker, `wait`
//! blocks until a post. Which one a deployment uses is a [`IpcKind`] runtime
//! choice; in-process workers and tests use [`ParkWake`].

use config::{IpcKind, names};
use parking_lot::{Condvar, Mutex};
use registry::WakeHandle;
use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// POSIX named semaphore, the default primitive.
#[derive(Debug)]
pub struct SemWake {
    sem: *mut libc::sem_t,
}

// The semaphore handle is a kernel object; the raw pointer is just its
// address and is safe to use from any thread.
#[allow(unsafe_code)]
unsafe impl Send for SemWake {}
#[allow(unsafe_code)]
unsafe impl Sync for SemWake {}

impl SemWake {
    /// Open (creating if needed) the named semaphore for an instance.
    ///
    /// # Errors
    ///
    /// Fails when `sem_open` does, e.g. under an exhausted namespace.
    #[allow(unsafe_code)]
    pub fn open(instance: u16) -> std::io::Result<Self> {
        let name = CString::new(format!("/{}", names::nf_wake(instance)))
            .map_err(|_| std::io::Error::other("name contains NUL"))?;
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT,
                libc::mode_t::from(0o600_u16),
                0_u32,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { sem })
    }
}

impl WakeHandle for SemWake {
    #[allow(unsafe_code)]
    fn post(&self) {
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    #[allow(unsafe_code)]
    fn wait(&self) {
        unsafe {
            libc::sem_wait(self.sem);
        }
    }
}

impl Drop for SemWake {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// SIGUSR1 to the worker pid. The waiting side pauses for any signal after
/// installing the no-op handler.
#[derive(Debug)]
pub struct SignalWake {
    pid: nix::unistd::Pid,
}

impl SignalWake {
    #[must_use]
    pub fn new(pid: i32) -> Self {
        Self {
            pid: nix::unistd::Pid::from_raw(pid),
        }
    }
}

impl WakeHandle for SignalWake {
    fn post(&self) {
        if let Err(e) = nix::sys::signal::kill(self.pid, nix::sys::signal::SIGUSR1) {
            debug!("wake signal to {} failed: {e}", self.pid);
        }
    }

    #[allow(unsafe_code)]
    fn wait(&self) {
        unsafe {
            libc::pause();
        }
    }
}

/// Install a no-op SIGUSR1 handler so a signal wake interrupts `pause`
/// instead of killing the worker.
///
/// # Errors
///
/// Propagates `sigaction` failure.
#[allow(unsafe_code)]
pub fn install_sigusr1_handler() -> nix::Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    extern "C" fn noop(_: libc::c_int) {}
    let action = SigAction::new(SigHandler::Handler(noop), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGUSR1, &action) }.map(|_| ())
}

/// Named pipe. Posting writes a byte with a non-blocking open so a missing
/// reader never wedges the manager.
#[derive(Debug)]
pub struct FifoWake {
    path: PathBuf,
}

impl FifoWake {
    /// Create (or reuse) the FIFO for an instance.
    ///
    /// # Errors
    ///
    /// Fails when the FIFO cannot be created.
    pub fn create(instance: u16) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(names::nf_wake(instance));
        match nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(std::io::Error::from(e)),
        }
        Ok(Self { path })
    }
}

impl WakeHandle for FifoWake {
    fn post(&self) {
        let opened = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);
        match opened {
            Ok(mut fifo) => {
                let _ = fifo.write(&[1]);
            }
            // No reader yet; nothing to wake.
            Err(e) => debug!("fifo wake post skipped: {e}"),
        }
    }

    fn wait(&self) {
        if let Ok(mut fifo) = std::fs::File::open(&self.path) {
            let mut byte = [0_u8; 1];
            let _ = fifo.read(&mut byte);
        }
    }
}

/// Unix datagram socket; the worker binds, the manager sends.
#[derive(Debug)]
pub struct SocketWake {
    path: PathBuf,
    receiver: OnceLock<UnixDatagram>,
}

impl SocketWake {
    #[must_use]
    pub fn new(instance: u16) -> Self {
        Self {
            path: std::env::temp_dir().join(format!("{}.sock", names::nf_wake(instance))),
            receiver: OnceLock::new(),
        }
    }
}

impl WakeHandle for SocketWake {
    fn post(&self) {
        match UnixDatagram::unbound() {
            Ok(socket) => {
                if let Err(e) = socket.send_to(&[1], &self.path) {
                    debug!("socket wake post skipped: {e}");
                }
            }
            Err(e) => debug!("socket wake post failed to open: {e}"),
        }
    }

    fn wait(&self) {
        let receiver = self.receiver.get_or_init(|| {
            let _ = std::fs::remove_file(&self.path);
            #[allow(clippy::expect_used)]
            UnixDatagram::bind(&self.path).expect("cannot bind wake socket")
        });
        let mut byte = [0_u8; 8];
        let _ = receiver.recv(&mut byte);
    }
}

/// Busy poll: no IPC at all; waiting is a yield.
#[derive(Debug, Default)]
pub struct PollWake;

impl WakeHandle for PollWake {
    fn post(&self) {}

    fn wait(&self) {
        std::thread::yield_now();
    }
}

/// In-process park/unpark on a condvar; what the scenario tests and
/// in-process workers use.
#[derive(Debug, Default)]
pub struct ParkWake {
    posted: Mutex<bool>,
    cv: Condvar,
}

impl WakeHandle for ParkWake {
    fn post(&self) {
        let mut posted = self.posted.lock();
        *posted = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.cv.wait(&mut posted);
        }
        *posted = false;
    }
}

/// Build the wake handle for a new NF, falling back to busy-poll when the
/// primitive cannot be set up (the manager never dies for an IPC hiccup).
#[must_use]
pub fn open(kind: IpcKind, instance: u16, pid: i32) -> Arc<Box<dyn WakeHandle>> {
    let handle: Box<dyn WakeHandle> = match kind {
        IpcKind::Semaphore => match SemWake::open(instance) {
            Ok(sem) => Box::new(sem),
            Err(e) => {
                warn!("semaphore for NF {instance} unavailable ({e}); busy-polling");
                Box::new(PollWake)
            }
        },
        IpcKind::Signal => Box::new(SignalWake::new(pid)),
        IpcKind::Fifo => match FifoWake::create(instance) {
            Ok(fifo) => Box::new(fifo),
            Err(e) => {
                warn!("fifo for NF {instance} unavailable ({e}); busy-polling");
                Box::new(PollWake)
            }
        },
        IpcKind::Socket => Box::new(SocketWake::new(instance)),
        IpcKind::Poll => Box::new(PollWake),
    };
    Arc::new(handle)
}
