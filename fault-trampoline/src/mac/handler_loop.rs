//! The single receiver thread: receive one message, classify it, dispatch
//! to the resolver bridge or the Forwarder, and reply or forward -- never
//! both.
//!
//! Grounded on `crash-handler/src/mac/state.rs`'s `exception_handler`
//! (receive/dispatch/reply loop), restructured so a protection fault goes
//! through this crate's resolver bridge and forwarder instead of a single
//! user callback that always replies `KERN_SUCCESS`/`KERN_FAILURE` inline.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::codec::MessageCodec;
use super::ffi::*;
use super::{forward, port, reply, resolver};
use crate::ResolveAccess;

/// The receive call is given this much time to notice a shutdown request;
/// the core itself never cancels a running fault servicing, so the timeout
/// is purely a liveness hedge (spec §4.3 step 1).
const RECEIVE_TIMEOUT_MS: message::mach_msg_timeout_t = 250;

/// Big enough for the widest request layout plus a generous Mach trailer;
/// `mach_msg` never writes past what it actually receives.
#[repr(C)]
struct RequestBuffer {
    request: RequestStateIdentity64,
    trailer: [u8; 128],
}

pub fn spawn(
    exception_port: mach_port_t,
    resolver_fn: Arc<dyn ResolveAccess>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("fault-trampoline".into())
        .spawn(move || run(exception_port, &*resolver_fn, &shutdown))
        .expect("failed to spawn fault-trampoline handler thread")
}

fn run(exception_port: mach_port_t, resolver_fn: &dyn ResolveAccess, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match receive(exception_port) {
            ReceiveOutcome::Message(request) => handle_one(exception_port, &request, resolver_fn),
            ReceiveOutcome::Timeout => continue,
            ReceiveOutcome::Malformed => {
                crate::write_stderr("fault-trampoline: received message failed to decode, codec is out of sync with the kernel\n");
                std::process::exit(1);
            }
            ReceiveOutcome::Fatal => {
                crate::write_stderr("fault-trampoline: mach_msg receive failed, terminating\n");
                std::process::exit(1);
            }
        }
    }
}

enum ReceiveOutcome {
    Message(RequestStateIdentity64),
    Timeout,
    Malformed,
    Fatal,
}

fn receive(exception_port: mach_port_t) -> ReceiveOutcome {
    // SAFETY: plain-old-data receive buffer, fully owned by this stack
    // frame; `mach_msg` only ever writes within `size` bytes of it.
    let mut buffer: RequestBuffer = unsafe { mem::zeroed() };
    let size = mem::size_of::<RequestBuffer>() as u32;

    let kr = unsafe {
        message::mach_msg(
            &mut buffer.request.header as *mut MachMsgHeader as *mut message::mach_msg_header_t,
            message::MACH_RCV_MSG,
            0,
            size,
            exception_port,
            RECEIVE_TIMEOUT_MS,
            MACH_PORT_NULL,
        )
    };

    match kr {
        KERN_SUCCESS => {
            let received = (buffer.request.header.size as usize).min(mem::size_of::<RequestStateIdentity64>());
            // SAFETY: `mach_msg` wrote exactly `buffer.request.header.size`
            // bytes starting at `buffer.request` and never touched
            // `trailer`; `received` is that length capped to the struct's
            // own size, so this stays within `buffer.request`'s bounds.
            let bytes = unsafe {
                std::slice::from_raw_parts(&buffer.request as *const RequestStateIdentity64 as *const u8, received)
            };
            match MessageCodec::decode_state_identity_64(bytes) {
                Ok(request) => ReceiveOutcome::Message(request),
                Err(_) => ReceiveOutcome::Malformed,
            }
        }
        message::MACH_RCV_TIMED_OUT => ReceiveOutcome::Timeout,
        _ => ReceiveOutcome::Fatal,
    }
}

/// What step 2's assertions determined about a received request.
enum Classification {
    /// `code[0] == KERN_PROTECTION_FAILURE`; `code[1]` is the faulting
    /// address, to hand to the resolver bridge.
    Protection(u64),
    /// A `BAD_ACCESS` of some other sub-kind; not ours to resolve.
    OtherBadAccess,
}

fn classify(exception_port: mach_port_t, request: &RequestStateIdentity64) -> Classification {
    assert_invariants(exception_port, request);
    if request.code[0] as i32 == KERN_PROTECTION_FAILURE {
        Classification::Protection(request.code[1] as u64)
    } else {
        Classification::OtherBadAccess
    }
}

/// Spec §4.3 step 2 / §7: a violation here means the kernel contract was
/// broken or the codec is out of sync with the kernel. Unrecoverable --
/// exits the process with a diagnostic rather than attempting to continue
/// with a request we can no longer trust the shape of.
fn assert_invariants(exception_port: mach_port_t, request: &RequestStateIdentity64) {
    let fatal = |why: &'static str| -> ! {
        crate::write_stderr(why);
        std::process::exit(1);
    };

    if request.header.id != MSG_ID_REQUEST_STATE_IDENTITY_64 {
        fatal("fault-trampoline: unexpected msg_id, codec is out of sync with the kernel\n");
    }
    if request.header.local_port != exception_port {
        fatal("fault-trampoline: message delivered on a port we don't own\n");
    }
    if request.task.name != port::owning_task() {
        fatal("fault-trampoline: message from a task other than our own\n");
    }
    if request.exception != et::EXC_BAD_ACCESS as i32 {
        fatal("fault-trampoline: non-BAD_ACCESS exception delivered to a BAD_ACCESS-only port\n");
    }
    if request.code_count != 2 {
        fatal("fault-trampoline: malformed request, code_count != 2\n");
    }
    if request.flavor != THREAD_STATE_NONE {
        fatal("fault-trampoline: thread state flavor does not match our registration\n");
    }
}

fn handle_one(exception_port: mach_port_t, request: &RequestStateIdentity64, resolver_fn: &dyn ResolveAccess) {
    match classify(exception_port, request) {
        Classification::Protection(address) => {
            let (handled, new_state, new_state_count) = resolver::resolve(resolver_fn, request, address);
            if handled {
                reply_and_send(request, KERN_SUCCESS, &new_state[..new_state_count as usize]);
            } else {
                forward_or_fail(request);
            }
        }
        Classification::OtherBadAccess => forward_or_fail(request),
    }
}

/// Forwards to the previously-installed handler if there is one; replies
/// `KERN_FAILURE` (so the kernel escalates to the next outer scope) if
/// there isn't, or if the forward itself failed to send.
fn forward_or_fail(request: &RequestStateIdentity64) {
    let previous = port::previous_port_for(request.thread.name as mt::thread_t);
    let forwarded = match previous {
        Some(p) if p.port != MACH_PORT_NULL => forward::forward(&p, request),
        _ => false,
    };
    if !forwarded {
        let old_state = &request.old_state[..request.old_state_count as usize];
        reply_and_send(request, KERN_FAILURE, old_state);
    }
}

fn reply_and_send(request: &RequestStateIdentity64, ret_code: kern_return_t, new_state: &[u32]) {
    let mut reply_msg = reply::build(request, ret_code, new_state);
    let size = reply_msg.header.size;

    // SAFETY: `reply_msg` starts with a `MachMsgHeader` matching
    // `mach_msg_header_t`'s ABI, and every byte up to `size` was populated
    // by `reply::build`.
    let kr = unsafe {
        message::mach_msg(
            &mut reply_msg.header as *mut MachMsgHeader as *mut message::mach_msg_header_t,
            message::MACH_SEND_MSG,
            size,
            0,
            MACH_PORT_NULL,
            message::MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    if kr != KERN_SUCCESS {
        crate::write_stderr("fault-trampoline: reply send failed, terminating\n");
        std::process::exit(1);
    }
}
