//! Builds the state-identity reply message: success or failure, and the
//! (possibly resolver-mutated) thread state to install on resume.
//!
//! Grounded on `original_source/code/protxc.c`'s `build_reply` and the
//! inline reply construction in `crash-handler/src/mac/state.rs`'s
//! `exception_handler`.

use std::mem;

use super::ffi::*;

/// The low 5 bits of `msgh_bits` carry the remote port's disposition (spec
/// §4.5's `MSGH_BITS_REMOTE`); the next 5 the local port's. A reply has no
/// local port, so that field is zero.
const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x1f;

/// Builds the reply to `request`, per spec §4.5:
///
/// - `bits` keeps the request's remote disposition, zero local disposition.
/// - `remote_port`/`msg_id` come straight from the request (the kernel-
///   supplied reply port, and `request.msg_id + 100`).
/// - `new_state`/`new_state_count` are `new_state` truncated or zero-padded
///   to `request.old_state_count` words, and `msg_size` covers only the
///   words actually declared -- not the full fixed-size array, or the
///   kernel silently discards the state.
pub fn build(
    request: &RequestStateIdentity64,
    ret_code: kern_return_t,
    new_state: &[u32],
) -> ReplyStateIdentity {
    // SAFETY: every field is written explicitly below; `zeroed()` only
    // supplies a valid starting bit pattern for this plain-old-data struct.
    let mut reply: ReplyStateIdentity = unsafe { mem::zeroed() };

    reply.header.bits = request.header.bits & MACH_MSGH_BITS_REMOTE_MASK;
    reply.header.remote_port = request.header.remote_port;
    reply.header.local_port = MACH_PORT_NULL;
    reply.header.voucher_port = MACH_PORT_NULL;
    reply.header.id = request.header.id + 100;

    reply.ndr = request.ndr;
    reply.ret_code = ret_code;
    reply.flavor = request.flavor;

    let count = new_state.len().min(MAX_STATE_WORDS);
    reply.new_state_count = count as u32;
    reply.new_state = [0; MAX_STATE_WORDS];
    reply.new_state[..count].copy_from_slice(&new_state[..count]);

    let size = ReplyStateIdentity::NEW_STATE_OFFSET + count * mem::size_of::<u32>();
    reply.header.size = size as u32;

    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestStateIdentity64 {
        // SAFETY: plain old data, every field used below overwritten.
        let mut r: RequestStateIdentity64 = unsafe { mem::zeroed() };
        r.header.id = MSG_ID_REQUEST_STATE_IDENTITY_64;
        r.header.bits = 0x1234_5600 | 17;
        r.header.remote_port = 99;
        r.ndr.mig_vers = 1;
        r.flavor = THREAD_STATE_NONE;
        r.old_state_count = 3;
        r.old_state[0] = 0xDEAD_BEEF;
        r
    }

    #[test]
    fn success_reply_has_msg_id_plus_100_and_preserves_state() {
        let request = sample_request();
        let state = &request.old_state[..request.old_state_count as usize];
        let reply = build(&request, KERN_SUCCESS, state);

        assert_eq!(reply.header.id, MSG_ID_REQUEST_STATE_IDENTITY_64 + 100);
        assert_eq!(reply.header.remote_port, request.header.remote_port);
        assert_eq!(reply.header.local_port, MACH_PORT_NULL);
        assert_eq!(reply.ret_code, KERN_SUCCESS);
        assert_eq!(reply.new_state_count, 3);
        assert_eq!({ reply.new_state[0] }, 0xDEAD_BEEF);
    }

    #[test]
    fn msg_size_covers_only_declared_state_words_not_the_full_struct() {
        let request = sample_request();
        let state = &request.old_state[..request.old_state_count as usize];
        let reply = build(&request, KERN_SUCCESS, state);

        let expected = ReplyStateIdentity::NEW_STATE_OFFSET + 3 * mem::size_of::<u32>();
        assert_eq!(reply.header.size as usize, expected);
        assert!((reply.header.size as usize) < mem::size_of::<ReplyStateIdentity>());
    }

    #[test]
    fn failure_reply_carries_kern_failure() {
        let request = sample_request();
        let reply = build(&request, KERN_FAILURE, &[]);
        assert_eq!(reply.ret_code, KERN_FAILURE);
        assert_eq!(reply.new_state_count, 0);
    }
}
