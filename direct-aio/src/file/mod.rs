//! File lifecycle for the storage engine's log files.
//!
//! [`Handle`] owns the descriptor and knows nothing about asynchronous I/O.
//! [`AsyncFile`] binds a handle to a [`CompletionDomain`](crate::CompletionDomain)
//! and issues reads and writes through it.

mod async_file;

pub use async_file::AsyncFile;

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::stat::Mode,
};
use tracing::{debug, warn};

use crate::{ops::OpKind, Error};

/// Alignment that offsets, lengths and buffer addresses of unbuffered I/O must honour.
pub const DEVICE_ALIGNMENT: usize = 512;

/// What [`Handle::open`] does depending on whether the file exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Create the file, or truncate it to zero length if it exists.
    CreateOrTruncate,
    /// Create the file if it is missing, otherwise open it as is.
    OpenOrCreate,
    /// Only open an existing file.
    OpenExisting,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    /// Bypass the page cache: `O_DIRECT` on Linux, `F_NOCACHE` on macOS.
    /// Unbuffered files only accept I/O aligned to [`DEVICE_ALIGNMENT`].
    pub unbuffered: bool,
}

/// Result of opening a file.
///
/// A missing file under [`CreateDisposition::OpenExisting`] is an expected
/// outcome for the engine, not an error.
#[derive(Debug)]
pub enum OpenOutcome<F> {
    Opened {
        file: F,
        /// Whether the file existed before the open call.
        existed: bool,
    },
    Missing,
}

impl<F> OpenOutcome<F> {
    pub fn into_file(self) -> Option<F> {
        match self {
            OpenOutcome::Opened { file, .. } => Some(file),
            OpenOutcome::Missing => None,
        }
    }

    pub fn existed(&self) -> bool {
        matches!(self, OpenOutcome::Opened { existed: true, .. })
    }

    pub fn map<G>(self, f: impl FnOnce(F) -> G) -> OpenOutcome<G> {
        match self {
            OpenOutcome::Opened { file, existed } => OpenOutcome::Opened {
                file: f(file),
                existed,
            },
            OpenOutcome::Missing => OpenOutcome::Missing,
        }
    }
}

/// Snapshot of a handle's I/O counters, see [`Handle::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub bytes_written: u64,
    pub read_count: u64,
    pub bytes_read: u64,
}

#[derive(Default)]
struct IoStatsStorage {
    bytes_written: AtomicU64,
    read_count: AtomicU64,
    bytes_read: AtomicU64,
}

/// An open file descriptor plus the metadata the I/O path needs.
///
/// Operations in flight hold a clone of the descriptor's `Arc`, so the
/// descriptor outlives [`Handle::close`] until the last of them completes.
pub struct Handle {
    fd: Option<Arc<OwnedFd>>,
    filename: PathBuf,
    unbuffered: bool,
    stats: IoStatsStorage,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("filename", &self.filename)
            .field("unbuffered", &self.unbuffered)
            .finish()
    }
}

impl Handle {
    pub fn open(
        path: impl AsRef<Path>,
        disposition: CreateDisposition,
        options: FileOptions,
    ) -> Result<OpenOutcome<Handle>, Error> {
        let path = path.as_ref();
        #[allow(unused_mut)]
        let mut flags = OFlag::O_RDWR | OFlag::O_CLOEXEC;
        #[cfg(target_os = "linux")]
        if options.unbuffered {
            flags |= OFlag::O_DIRECT;
        }
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        let (fd, existed) = match disposition {
            CreateDisposition::OpenExisting => match nix::fcntl::open(path, flags, mode) {
                Ok(fd) => (fd, true),
                Err(Errno::ENOENT) => {
                    debug!(path = %path.display(), "file does not exist");
                    return Ok(OpenOutcome::Missing);
                }
                Err(e) => return Err(e.into()),
            },
            CreateDisposition::CreateOrTruncate | CreateDisposition::OpenOrCreate => {
                // O_EXCL tells us whether we created the file. If it exists,
                // reopen without O_CREAT; if it vanished in between, try again.
                loop {
                    match nix::fcntl::open(path, flags | OFlag::O_CREAT | OFlag::O_EXCL, mode) {
                        Ok(fd) => break (fd, false),
                        Err(Errno::EEXIST) => {}
                        Err(e) => return Err(e.into()),
                    }
                    let reopen_flags = if disposition == CreateDisposition::CreateOrTruncate {
                        flags | OFlag::O_TRUNC
                    } else {
                        flags
                    };
                    match nix::fcntl::open(path, reopen_flags, mode) {
                        Ok(fd) => break (fd, true),
                        Err(Errno::ENOENT) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        };
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        #[cfg(target_os = "macos")]
        if options.unbuffered {
            // SAFETY: plain fcntl on a descriptor we own.
            if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
                return Err(io::Error::last_os_error().into());
            }
        }

        debug!(path = %path.display(), fd = fd.as_raw_fd(), existed, ?disposition, "opened file");
        Ok(OpenOutcome::Opened {
            file: Handle {
                fd: Some(Arc::new(fd)),
                filename: path.to_owned(),
                unbuffered: options.unbuffered,
                stats: IoStatsStorage::default(),
            },
            existed,
        })
    }

    /// Adopt a descriptor opened elsewhere. `unbuffered` only controls the
    /// alignment checks; the descriptor's flags are left alone.
    pub fn from_owned_fd(fd: OwnedFd, filename: impl Into<PathBuf>, unbuffered: bool) -> Handle {
        Handle {
            fd: Some(Arc::new(fd)),
            filename: filename.into(),
            unbuffered,
            stats: IoStatsStorage::default(),
        }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn is_unbuffered(&self) -> bool {
        self.unbuffered
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn device_alignment(&self) -> usize {
        DEVICE_ALIGNMENT
    }

    /// Release the descriptor. Closing twice is a no-op.
    ///
    /// If operations are still in flight, the `close(2)` happens when the last
    /// of them completes and its error, if any, is not reported.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(fd) {
            Ok(fd) => {
                nix::unistd::close(fd.into_raw_fd())?;
                Ok(())
            }
            Err(shared) => {
                debug!(
                    fd = shared.as_raw_fd(),
                    "operations in flight, deferring close until they complete"
                );
                Ok(())
            }
        }
    }

    /// Close the handle and remove the file from the filesystem.
    pub fn delete(&mut self) -> Result<(), Error> {
        self.close()?;
        nix::unistd::unlink(self.filename.as_path())?;
        Ok(())
    }

    /// Current file size in bytes; 0 if the handle is closed or `fstat` fails.
    pub fn size(&self) -> u64 {
        let Some(fd) = &self.fd else {
            return 0;
        };
        match nix::sys::stat::fstat(fd.as_raw_fd()) {
            Ok(st) => u64::try_from(st.st_size).unwrap_or(0),
            Err(e) => {
                warn!(fd = fd.as_raw_fd(), error = %e, "fstat failed");
                0
            }
        }
    }

    pub fn stats(&self) -> IoStats {
        IoStats {
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            read_count: self.stats.read_count.load(Ordering::Relaxed),
            bytes_read: self.stats.bytes_read.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_submission(&self, kind: OpKind, len: usize) {
        let len = len as u64;
        match kind {
            OpKind::Read => {
                self.stats.read_count.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_read.fetch_add(len, Ordering::Relaxed);
            }
            OpKind::Write => {
                self.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn shared_fd(&self) -> Result<Arc<OwnedFd>, Error> {
        self.fd
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::Io(io::Error::from_raw_os_error(libc::EBADF)))
    }

    pub(crate) fn check_alignment(&self, offset: u64, addr: usize, len: usize) -> Result<(), Error> {
        if !self.unbuffered {
            return Ok(());
        }
        let alignment = DEVICE_ALIGNMENT;
        if offset % alignment as u64 != 0 || len % alignment != 0 || addr % alignment != 0 {
            return Err(Error::Misaligned {
                offset,
                len,
                addr,
                alignment,
            });
        }
        Ok(())
    }
}
