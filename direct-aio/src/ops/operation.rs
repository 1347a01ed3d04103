use std::{
    any::Any,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use crate::{
    ops::{Op, OpKind},
    Error,
};

/// Object-safe view of an [`Op`] so that domains can store operations of any
/// buffer, context and callback type side by side.
trait ErasedOp: Send {
    fn complete(self: Box<Self>, res: Result<usize, Error>);
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<O: Op> ErasedOp for O {
    fn complete(self: Box<Self>, res: Result<usize, Error>) {
        (*self).on_op_completion(res)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Everything needed to finish one outstanding I/O independently of the
/// submitter's stack frame.
///
/// Boxed so that `iov` has a stable address: the io_uring domain hands a
/// pointer to it to the kernel. A domain owns the `Operation` from submission
/// until it calls [`Operation::complete`]; the kernel only ever sees the
/// operation's slot index, see [`crate::domain::slots`].
pub struct Operation {
    pub(crate) kind: OpKind,
    pub(crate) offset: u64,
    /// Single-element I/O vector describing the buffer.
    pub(crate) iov: libc::iovec,
    /// How many times the operation has been handed to the kernel.
    pub(crate) attempts: u32,
    fd: Arc<OwnedFd>,
    op: Box<dyn ErasedOp>,
}

// SAFETY: `iov` points into the buffer owned by `op`, which is `Send`.
unsafe impl Send for Operation {}

impl Operation {
    pub(crate) fn new<O: Op>(fd: Arc<OwnedFd>, mut op: O) -> Box<Operation> {
        let (base, len) = op.io_slice();
        Box::new(Operation {
            kind: op.kind(),
            offset: op.offset(),
            iov: libc::iovec {
                iov_base: base.cast(),
                iov_len: len,
            },
            attempts: 0,
            fd,
            op: Box::new(op),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn fd(&self) -> &Arc<OwnedFd> {
        &self.fd
    }

    pub(crate) fn buf_ptr(&self) -> *mut u8 {
        self.iov.iov_base.cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.iov.iov_len
    }

    /// Run the caller's callback and release the operation.
    pub(crate) fn complete(self: Box<Self>, res: Result<usize, Error>) {
        let Operation { op, .. } = *self;
        op.complete(res)
    }

    /// Recover the caller's resources of an operation that never reached the kernel.
    pub(crate) fn into_resources<O: Op>(self: Box<Self>) -> O::Resources {
        let Operation { op, .. } = *self;
        match op.into_any().downcast::<O>() {
            Ok(op) => op.on_failed_submission(),
            Err(_) => panic!("implementation error: operation changed type while owned by a domain"),
        }
    }
}

/// An operation a domain refused to hand to the kernel, with the reason.
pub struct Rejected {
    pub(crate) error: Error,
    pub(crate) op: Box<Operation>,
}

impl Rejected {
    pub(crate) fn new(error: Error, op: Box<Operation>) -> Self {
        Rejected { error, op }
    }
}
