//! Structured-exception-handling filter entry point: the degenerate
//! single-function shape of this barrier on a platform that delivers
//! exceptions synchronously to the faulting thread instead of to a
//! separate handler thread.
//!
//! Grounded on `crash-handler/src/windows/state.rs`'s `handle_exception`
//! (same `EXCEPTION_POINTERS` plumbing, same `EXCEPTION_CONTINUE_SEARCH`/
//! `EXCEPTION_CONTINUE_EXECUTION` return convention), reduced to just the
//! filter path -- handler-chain bookkeeping (previous filter stacking,
//! invalid-parameter/purecall handlers) belongs to general crash handling,
//! not to this protection barrier specifically (spec §6).

use windows_sys::Win32::Foundation::EXCEPTION_ACCESS_VIOLATION;
use windows_sys::Win32::System::Diagnostics::Debug::{
    EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
};

use fault_context::{AccessMode, MutatorFaultContext};

use crate::ResolveAccess;

/// Resolves access violations through `resolver`; anything else -- a
/// different exception code, or an access the resolver declines -- returns
/// `EXCEPTION_CONTINUE_SEARCH` so the next filter in the chain (or the
/// default OS handler) runs instead.
///
/// # Safety
///
/// Must only be called by the Windows exception dispatcher, or a test
/// harness simulating it, with a live `EXCEPTION_POINTERS` for the
/// currently-faulting thread.
pub unsafe fn seh_filter(resolver: &dyn ResolveAccess, info: *const EXCEPTION_POINTERS) -> i32 {
    prot_filter(resolver, info)
}

unsafe fn prot_filter(resolver: &dyn ResolveAccess, info: *const EXCEPTION_POINTERS) -> i32 {
    let Some(record) = (*info).ExceptionRecord.as_ref() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // ExceptionInformation[0] is 0 for a read, 1 for a write, 8 for a DEP
    // (execute) violation; ExceptionInformation[1] is the faulting address.
    // Unlike Mach, Windows disambiguates, so only the one bit that applies
    // is set -- an execute violation is neither, so it sets neither.
    let mode = match record.ExceptionInformation[0] {
        0 => AccessMode::READ,
        1 => AccessMode::WRITE,
        _ => AccessMode::empty(),
    };
    let address = record.ExceptionInformation[1] as u64;

    let mut ctx = MutatorFaultContext { address, exception_pointers: info };

    if resolver.resolve_access(mode, &mut ctx) {
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}
