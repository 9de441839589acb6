mod codec;
mod ffi;
mod forward;
mod handler_loop;
mod port;
mod reply;
mod resolver;

use crate::{Error, ResolveAccess};

/// Owns the kernel-level Mach exception port that receives protection
/// faults for this process. Created once per process via [`ExceptionPort::setup`].
pub struct ExceptionPort {
    _private: (),
}

impl ExceptionPort {
    /// Allocates the exception port, launches the handler thread, and
    /// registers the calling thread as the first mutator thread.
    ///
    /// Idempotent: calling this more than once across the process returns
    /// [`Error::AlreadyInstalled`] on every call after the first, rather
    /// than creating a second port or thread -- concurrent callers all
    /// observe a single, fully-initialized subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error if a trampoline is already installed, or if any of
    /// the kernel calls involved in setting one up fail.
    pub fn setup(resolver: Box<dyn ResolveAccess>) -> Result<Self, Error> {
        port::setup(resolver)?;
        Ok(Self { _private: () })
    }

    /// Registers the calling thread as a mutator: its `EXC_BAD_ACCESS`
    /// exception port is swapped to this trampoline's port, and whatever was
    /// previously registered is recorded so the forwarder can re-encode
    /// messages for it.
    ///
    /// The thread that called [`Self::setup`] is already registered as part
    /// of setup; calling this again for that same thread is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `thread_swap_exception_ports` call
    /// fails.
    pub fn register_thread(&self) -> Result<(), Error> {
        port::register_thread(false)
    }
}

impl Drop for ExceptionPort {
    fn drop(&mut self) {
        port::teardown();
    }
}
