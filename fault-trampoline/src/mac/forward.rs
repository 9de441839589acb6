//! Retransmits an exception this trampoline doesn't own to the previously
//! installed handler, in that handler's expected wire format.
//!
//! Grounded on the `#if 0`-gated forwarding branch of
//! `original_source/code/protxc.c`'s `handle_one` -- the spec this module
//! implements calls that branch out as the intended design despite being
//! dead code there, and this is the real, tested version of it.

use super::codec::{Behavior, BehaviorFamily, EncodedRequest, MessageCodec, ReacquiredState};
use super::ffi::*;
use super::port::PreviousPort;

/// Attempts to retransmit `request` to the handler described by `previous`.
/// Returns `true` if the forward was sent -- no reply is then sent by this
/// module, since the downstream handler's reply goes straight back to the
/// kernel on the preserved reply port. Returns `false` if re-acquiring
/// state or sending failed, so the caller can fall back to a `FAILURE`
/// reply itself rather than hang the faulting thread.
pub fn forward(previous: &PreviousPort, request: &RequestStateIdentity64) -> bool {
    let family = behavior_family(previous.behavior);
    let wide_codes = carries_mach_exception_codes(previous.behavior);
    let behavior = Behavior { family, wide_codes, flavor: previous.flavor };

    let reacquired = match family {
        BehaviorFamily::Default => None,
        BehaviorFamily::State | BehaviorFamily::StateIdentity => {
            match reacquire_state(request.thread.name as mt::thread_t, previous.flavor) {
                Some(words) => Some(words),
                None => return false,
            }
        }
    };
    let state = reacquired
        .as_ref()
        .map(|words| ReacquiredState { flavor: previous.flavor, words: &words[..] });

    let mut encoded = MessageCodec::encode_as(behavior, request, state);
    // The forwarded message goes to the previous handler's port; its reply
    // port (remote_port) is left exactly as the kernel delivered it, so the
    // downstream handler's reply goes straight back to the kernel.
    encoded.header_mut().local_port = previous.port;

    send(&mut encoded)
}

fn reacquire_state(thread: mt::thread_t, flavor: ts::thread_state_flavor_t) -> Option<Vec<u32>> {
    let mut state = [0u32; MAX_STATE_WORDS];
    let mut count = MAX_STATE_WORDS as u32;
    // SAFETY: `thread` names the suspended faulting thread (a valid send
    // right delivered in the original request); `state`/`count` point at
    // valid stack storage sized to the largest flavor we know about.
    let kr = unsafe { thread_act::thread_get_state(thread, flavor, state.as_mut_ptr(), &mut count) };
    if kr != KERN_SUCCESS {
        return None;
    }
    Some(state[..count as usize].to_vec())
}

fn send(encoded: &mut EncodedRequest) -> bool {
    let size = encoded.send_size();
    let header_ptr = encoded.header_mut() as *mut MachMsgHeader as *mut message::mach_msg_header_t;
    // SAFETY: every variant of `EncodedRequest` starts with a
    // `MachMsgHeader` matching `mach_msg_header_t`'s ABI, and `encode_as`
    // populated every byte up to `size`.
    let kr = unsafe {
        message::mach_msg(
            header_ptr,
            message::MACH_SEND_MSG,
            size,
            0,
            MACH_PORT_NULL,
            message::MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    kr == KERN_SUCCESS
}

fn behavior_family(behavior: et::exception_behavior_t) -> BehaviorFamily {
    let base = behavior & !(et::MACH_EXCEPTION_CODES as et::exception_behavior_t);
    if base == et::EXCEPTION_STATE_IDENTITY {
        BehaviorFamily::StateIdentity
    } else if base == et::EXCEPTION_STATE {
        BehaviorFamily::State
    } else {
        BehaviorFamily::Default
    }
}

fn carries_mach_exception_codes(behavior: et::exception_behavior_t) -> bool {
    behavior & (et::MACH_EXCEPTION_CODES as et::exception_behavior_t) != 0
}
