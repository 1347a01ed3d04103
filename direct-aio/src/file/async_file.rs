use std::{future::Future, path::Path, sync::Arc};

use futures::{
    future::{self, Either},
    FutureExt,
};

use aio_common::buf::{IoBuf, IoBufMut};

use crate::{
    domain::CompletionDomain,
    file::{CreateDisposition, FileOptions, Handle, IoStats, OpenOutcome},
    ops::{read::ReadOp, write::WriteOp, Op, Operation, Rejected},
    Error, SubmitError,
};

/// A [`Handle`] bound to the [`CompletionDomain`] that performs its I/O.
///
/// `read` and `write` return as soon as the operation is handed to the domain.
/// The callback runs later, on whichever thread calls
/// [`CompletionDomain::try_complete`] and observes the completion.
pub struct AsyncFile<D: ?Sized> {
    handle: Handle,
    domain: Arc<D>,
}

impl<D: CompletionDomain + ?Sized> AsyncFile<D> {
    pub fn open(
        path: impl AsRef<Path>,
        disposition: CreateDisposition,
        options: FileOptions,
        domain: Arc<D>,
    ) -> Result<OpenOutcome<Self>, Error> {
        Ok(Handle::open(path, disposition, options)?.map(|handle| AsyncFile { handle, domain }))
    }

    pub fn from_handle(handle: Handle, domain: Arc<D>) -> Self {
        AsyncFile { handle, domain }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn domain(&self) -> &Arc<D> {
        &self.domain
    }

    /// Read up to `buf.bytes_total()` bytes at `offset` into `buf`.
    ///
    /// On success `callback` is eventually invoked exactly once with `(context, buf)`
    /// and the number of bytes read; the buffer's initialized length is advanced
    /// accordingly. If the submission is rejected, the callback is dropped unused
    /// and `context` and `buf` come back in the error.
    pub fn read<B, C, F>(
        &self,
        offset: u64,
        buf: B,
        context: C,
        callback: F,
    ) -> Result<(), SubmitError<(C, B)>>
    where
        B: IoBufMut + Send,
        C: Send + 'static,
        F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
    {
        self.submit(ReadOp {
            offset,
            buf,
            context,
            callback,
        })
    }

    /// Write the `buf.bytes_init()` initialized bytes of `buf` at `offset`.
    /// Same contract as [`AsyncFile::read`].
    pub fn write<B, C, F>(
        &self,
        offset: u64,
        buf: B,
        context: C,
        callback: F,
    ) -> Result<(), SubmitError<(C, B)>>
    where
        B: IoBuf + Send,
        C: Send + 'static,
        F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
    {
        self.submit(WriteOp {
            offset,
            buf,
            context,
            callback,
        })
    }

    /// Like [`AsyncFile::read`], but resolves a future instead of running a callback.
    ///
    /// Something must drive the domain for the future to complete, e.g.
    /// [`crate::driver::spawn_driver`].
    pub fn read_owned<B>(
        &self,
        offset: u64,
        buf: B,
    ) -> impl Future<Output = (B, Result<usize, Error>)> + Send + 'static
    where
        B: IoBufMut + Send,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let submitted = self.read(offset, buf, tx, |(tx, buf), res| {
            // the receiving future may have been dropped
            let _ = tx.send((buf, res));
        });
        owned_result(submitted, rx)
    }

    /// Future-returning variant of [`AsyncFile::write`].
    pub fn write_owned<B>(
        &self,
        offset: u64,
        buf: B,
    ) -> impl Future<Output = (B, Result<usize, Error>)> + Send + 'static
    where
        B: IoBuf + Send,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let submitted = self.write(offset, buf, tx, |(tx, buf), res| {
            let _ = tx.send((buf, res));
        });
        owned_result(submitted, rx)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.handle.close()
    }

    pub fn delete(&mut self) -> Result<(), Error> {
        self.handle.delete()
    }

    pub fn size(&self) -> u64 {
        self.handle.size()
    }

    pub fn device_alignment(&self) -> usize {
        self.handle.device_alignment()
    }

    pub fn stats(&self) -> IoStats {
        self.handle.stats()
    }

    fn submit<O: Op>(&self, mut op: O) -> Result<(), SubmitError<O::Resources>> {
        let (ptr, len) = op.io_slice();
        let check = self.handle.shared_fd().and_then(|fd| {
            if u32::try_from(len).is_err() {
                return Err(Error::LengthOverflow(len));
            }
            self.handle.check_alignment(op.offset(), ptr as usize, len)?;
            Ok(fd)
        });
        let fd = match check {
            Ok(fd) => fd,
            Err(error) => {
                return Err(SubmitError {
                    error,
                    resources: op.on_failed_submission(),
                })
            }
        };
        let kind = op.kind();
        match self.domain.submit(Operation::new(fd, op)) {
            Ok(()) => {
                self.handle.record_submission(kind, len);
                Ok(())
            }
            Err(Rejected { error, op }) => Err(SubmitError {
                error,
                resources: op.into_resources::<O>(),
            }),
        }
    }
}

fn owned_result<C, B>(
    submitted: Result<(), SubmitError<(C, B)>>,
    rx: tokio::sync::oneshot::Receiver<(B, Result<usize, Error>)>,
) -> impl Future<Output = (B, Result<usize, Error>)> + Send + 'static
where
    B: Send + 'static,
{
    match submitted {
        Ok(()) => Either::Left(rx.map(|res| match res {
            Ok(done) => done,
            Err(_) => panic!("implementation error: operation released without running its callback"),
        })),
        Err(e) => {
            let ((_, buf), error) = e.into_parts();
            Either::Right(future::ready((buf, Err(error))))
        }
    }
}

impl<D: ?Sized> std::fmt::Debug for AsyncFile<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFile")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
