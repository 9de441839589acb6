//! macOS-specific fault context, built from the fields of a received
//! `exception_raise_state_identity` request.

use mach2::{mach_types as mt, thread_status as ts};

/// Number of `natural_t` words in the largest thread state flavor Mach can
/// report (`x86_THREAD_STATE`/`ARM_THREAD_STATE64` with room to spare).
///
/// Matches `old_state[224]` in the hand-rolled request structs -- see
/// `fault-trampoline::mac::ffi`.
pub const MAX_STATE_WORDS: usize = 224;

/// A snapshot of the faulting thread, handed to the collector's
/// `resolve_access` upcall.
///
/// This is intentionally a flat, `Copy`-able struct: the handler thread that
/// builds it must not retain references into the kernel-owned request
/// message after the reply has been sent.
#[derive(Copy, Clone)]
pub struct MutatorFaultContext {
    /// The address that was protected and could not be accessed.
    pub address: u64,
    /// The thread that took the fault.
    pub thread: mt::thread_t,
    /// The task (process) that owns `thread`. Always the current task; carried
    /// along so callbacks don't need to call `mach_task_self` themselves.
    pub task: mt::task_t,
    /// The thread-state flavor that `thread_state` was captured with.
    pub state_flavor: ts::thread_state_flavor_t,
    /// How many of the leading words of `thread_state` are valid.
    pub state_count: u32,
    /// The suspended thread's register file, in the platform's native thread
    /// state encoding. A resolver that wants to e.g. single-step past a weak
    /// reference read mutates this array in place; the mutated state is
    /// threaded back into the reply by the caller.
    pub thread_state: [u32; MAX_STATE_WORDS],
}
