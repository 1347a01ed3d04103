use aio_common::buf::IoBufMut;

use crate::{
    ops::{Op, OpKind},
    Error,
};

pub struct ReadOp<B, C, F>
where
    B: IoBufMut + Send,
    C: Send + 'static,
    F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
{
    pub(crate) offset: u64,
    pub(crate) buf: B,
    pub(crate) context: C,
    pub(crate) callback: F,
}

impl<B, C, F> crate::sealed::Sealed for ReadOp<B, C, F>
where
    B: IoBufMut + Send,
    C: Send + 'static,
    F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
{
}

impl<B, C, F> Op for ReadOp<B, C, F>
where
    B: IoBufMut + Send,
    C: Send + 'static,
    F: FnOnce((C, B), Result<usize, Error>) + Send + 'static,
{
    type Resources = (C, B);

    fn kind(&self) -> OpKind {
        OpKind::Read
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn io_slice(&mut self) -> (*mut u8, usize) {
        (self.buf.stable_mut_ptr(), self.buf.bytes_total())
    }

    fn on_failed_submission(self) -> Self::Resources {
        (self.context, self.buf)
    }

    fn on_op_completion(mut self, res: Result<usize, Error>) {
        if let Ok(n) = res {
            // SAFETY: the kernel (or a worker's pread) initialized `n` bytes from the buffer start.
            unsafe { IoBufMut::set_init(&mut self.buf, n) };
        }
        (self.callback)((self.context, self.buf), res)
    }
}
