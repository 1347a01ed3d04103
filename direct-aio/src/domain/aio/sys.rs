//! Raw Linux AIO syscalls. libc does not wrap them and does not define the
//! kernel's `iocb` / `io_event` layouts, so they are mirrored here.

use std::{io, ptr, time::Duration};

use crate::ops::OpKind;

pub(super) type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// `struct iocb` from `<linux/aio_abi.h>`.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub(super) struct Iocb {
    aio_data: u64,
    #[cfg(target_endian = "little")]
    aio_key: u32,
    #[cfg(target_endian = "little")]
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    aio_key: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

impl Iocb {
    pub(super) fn new(
        kind: OpKind,
        fd: libc::c_int,
        buf: *mut u8,
        len: usize,
        offset: u64,
        tag: u64,
    ) -> Iocb {
        Iocb {
            aio_data: tag,
            aio_lio_opcode: match kind {
                OpKind::Read => IOCB_CMD_PREAD,
                OpKind::Write => IOCB_CMD_PWRITE,
            },
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            ..Default::default()
        }
    }
}

/// `struct io_event`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
pub(super) struct IoEvent {
    pub(super) data: u64,
    pub(super) obj: u64,
    pub(super) res: i64,
    pub(super) res2: i64,
}

pub(super) fn io_setup(max_events: u32) -> io::Result<AioContext> {
    let mut ctx: AioContext = 0;
    // SAFETY: `ctx` is a valid out-pointer and must be zero on entry.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_setup,
            max_events as libc::c_long,
            &mut ctx as *mut AioContext,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ctx)
}

pub(super) fn io_destroy(ctx: AioContext) -> io::Result<()> {
    // SAFETY: `ctx` came from `io_setup` and is destroyed once.
    let ret = unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Submit exactly one control block. The kernel copies it during the call.
pub(super) fn io_submit_one(ctx: AioContext, iocb: &mut Iocb) -> io::Result<()> {
    let mut iocbs = [iocb as *mut Iocb];
    // SAFETY: one valid iocb pointer; the buffer it references is kept alive
    // by the caller until the matching event is reaped.
    let ret = unsafe { libc::syscall(libc::SYS_io_submit, ctx, 1 as libc::c_long, iocbs.as_mut_ptr()) };
    match ret {
        1 => Ok(()),
        0 => Err(io::Error::from_raw_os_error(libc::EAGAIN)),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Reap at most one event, waiting at most `timeout`. An interrupted wait
/// counts as "nothing ready".
pub(super) fn io_getevent(ctx: AioContext, timeout: Duration) -> io::Result<Option<IoEvent>> {
    let mut event = IoEvent::default();
    let mut ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: room for exactly one event, and a valid timespec.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            1 as libc::c_long,
            1 as libc::c_long,
            ptr::addr_of_mut!(event),
            ptr::addr_of_mut!(ts),
        )
    };
    match ret {
        1 => Ok(Some(event)),
        0 => Ok(None),
        _ => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}
