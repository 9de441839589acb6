//! Builds a [`MutatorFaultContext`] from a received request and calls the
//! collector's single `resolve_access` upcall.
//!
//! Grounded on `original_source/code/protxc.c`'s `catch_bad_access`, which
//! packages the faulting address and thread state into a context struct and
//! calls the collector's `ArenaAccess` directly; here that's replaced by a
//! caller-supplied closure so this crate has no knowledge of collector
//! internals (spec §9: "break the cycle with a single upcall function
//! pointer supplied at `setup()`").

use fault_context::{AccessMode, MutatorFaultContext};

use super::ffi::{RequestStateIdentity64, MAX_STATE_WORDS};
use crate::ResolveAccess;

/// Calls `resolver` with a context built from `request` and `address`.
/// Returns whether the access was resolved, together with the (possibly
/// resolver-mutated) thread state and its word count, ready for
/// [`super::reply::build`].
///
/// Mach doesn't tell us whether the trap was a read or a write, so both
/// bits of `AccessMode` are passed at once -- matching `catch_bad_access`'s
/// `ArenaAccess(addr, AccessREAD | AccessWRITE, &ctx)` verbatim, and "both
/// bits are passed to the upcall verbatim" per spec §4.4.
pub fn resolve(
    resolver: &dyn ResolveAccess,
    request: &RequestStateIdentity64,
    address: u64,
) -> (bool, [u32; MAX_STATE_WORDS], u32) {
    let mut ctx = MutatorFaultContext {
        address,
        thread: request.thread.name,
        task: request.task.name,
        state_flavor: request.flavor,
        state_count: request.old_state_count,
        thread_state: request.old_state,
    };

    // The resolver runs on the handler thread while the faulting mutator
    // thread is suspended by the kernel; it must not touch that thread's
    // user stack or any lock it could hold (spec §4.4, §5).
    let handled = resolver.resolve_access(AccessMode::READ | AccessMode::WRITE, &mut ctx);

    (handled, ctx.thread_state, ctx.state_count)
}
