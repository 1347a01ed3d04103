use aio_common::buf::IoBuf;

use crate::{
    ops::{Op, OpKind},
    Error,
};

pub struct WriteOp<B, C, F>
where
    B: IoBuf + Send,
    C: Send + 'static,
    F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
{
    pub(crate) offset: u64,
    pub(crate) buf: B,
    pub(crate) context: C,
    pub(crate) callback: F,
}

impl<B, C, F> crate::sealed::Sealed for WriteOp<B, C, F>
where
    B: IoBuf + Send,
    C: Send + 'static,
    F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
{
}

impl<B, C, F> Op for WriteOp<B, C, F>
where
    B: IoBuf + Send,
    C: Send + 'static,
    F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
{
    type Resources = (C, B);

    fn kind(&self) -> OpKind {
        OpKind::Write
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn io_slice(&mut self) -> (*mut u8, usize) {
        // The kernel only reads through this pointer.
        (self.buf.stable_ptr() as *mut u8, self.buf.bytes_init())
    }

    fn on_failed_submission(self) -> Self::Resources {
        (self.context, self.buf)
    }

    fn on_op_completion(self, res: Result<usize, Error>) {
        (self.callback)((self.context, self.buf), res)
    }
}
