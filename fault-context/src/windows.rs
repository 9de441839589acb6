//! Windows-specific fault context. Windows delivers exceptions synchronously
//! on the faulting thread itself (no separate handler thread), so there is no
//! thread/task identity to carry -- the filter runs with the full
//! `EXCEPTION_POINTERS` already in hand.

use windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS;

/// A snapshot of the faulting thread, handed to the collector's
/// `resolve_access` upcall.
pub struct MutatorFaultContext {
    /// The address that was protected and could not be accessed.
    pub address: u64,
    /// Pointer into the faulting thread's own stack; valid only for the
    /// duration of the filter call.
    pub exception_pointers: *const EXCEPTION_POINTERS,
}
