//! The [`Op`] trait and the operations the file facade submits.

mod operation;
pub mod read;
pub mod write;

pub(crate) use operation::{Operation, Rejected};

use crate::Error;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// An I/O operation and the resources it operates on.
///
/// For each kind of operation, there is a struct that implements this trait.
/// The operation owns the buffer and the caller's context from submission until
/// either [`Op::on_failed_submission`] hands them back, or
/// [`Op::on_op_completion`] hands them to the caller's callback.
pub trait Op: crate::sealed::Sealed + Sized + Send + 'static {
    type Resources: Send + 'static;
    fn kind(&self) -> OpKind;
    fn offset(&self) -> u64;
    /// Memory the kernel transfers to or from.
    ///
    /// The pointer must stay valid while `self` is owned by a completion domain,
    /// even if `self` is moved; see [`crate::IoBuf`].
    fn io_slice(&mut self) -> (*mut u8, usize);
    fn on_failed_submission(self) -> Self::Resources;
    /// Consume the operation and run its callback. `res` is the number of bytes
    /// transferred on success.
    fn on_op_completion(self, res: Result<usize, Error>);
}
