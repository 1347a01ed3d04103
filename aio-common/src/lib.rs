pub mod buf;

#[cfg(target_os = "linux")]
pub use io_uring;
pub use libc;
