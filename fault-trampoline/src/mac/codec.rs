//! `MessageCodec`: encodes the canonical fault request into whichever of
//! the six wire layouts a previously-installed exception handler expects,
//! and decodes a raw received message back into a typed layout.
//!
//! Encoding is ported from the `#if 0`-gated forwarding branch of
//! `original_source/code/protxc.c`'s `handle_one`, which the spec this
//! module implements calls out as "the intended design" despite being dead
//! code there (`COPY_COMMON`/`COPY_IDENTITY`/`COPY_STATE`/`COPY_REQUEST*`).
//! Decoding has no analogue in `protxc.c` (the original receives straight
//! into a fixed `request_si64_s` and never decodes the other five shapes at
//! all), so it's modeled after `crash-handler/src/mac/ffi.rs`'s approach of
//! reading a typed struct out of a raw `mach_msg` receive buffer, generalized
//! to dispatch on `msgh_id` across all six layouts.

use super::ffi::*;
use crate::Error;
use std::mem;

/// The exception-behavior family a previously-installed handler registered
/// with, independent of code width.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BehaviorFamily {
    /// No identity, no state.
    Default,
    /// State, no identity.
    State,
    /// State and identity -- the family this module itself registers with.
    StateIdentity,
}

/// A previously-installed handler's exact registration: family, code width,
/// and (for `State`/`StateIdentity`) the thread-state flavor it expects.
#[derive(Copy, Clone, Debug)]
pub struct Behavior {
    pub family: BehaviorFamily,
    pub wide_codes: bool,
    pub flavor: ts::thread_state_flavor_t,
}

/// One of the six wire layouts, ready to be sent.
pub enum EncodedRequest {
    Default32(Request32),
    Default64(Request64),
    State32(RequestState32),
    State64(RequestState64),
    StateIdentity32(RequestStateIdentity32),
    StateIdentity64(RequestStateIdentity64),
}

impl EncodedRequest {
    /// Mutable access to the common message header every layout starts with,
    /// so the forwarder can set `local_port` without matching on the variant.
    pub fn header_mut(&mut self) -> &mut MachMsgHeader {
        match self {
            Self::Default32(r) => &mut r.header,
            Self::Default64(r) => &mut r.header,
            Self::State32(r) => &mut r.header,
            Self::State64(r) => &mut r.header,
            Self::StateIdentity32(r) => &mut r.header,
            Self::StateIdentity64(r) => &mut r.header,
        }
    }

    pub fn header(&self) -> &MachMsgHeader {
        match self {
            Self::Default32(r) => &r.header,
            Self::Default64(r) => &r.header,
            Self::State32(r) => &r.header,
            Self::State64(r) => &r.header,
            Self::StateIdentity32(r) => &r.header,
            Self::StateIdentity64(r) => &r.header,
        }
    }

    /// Size in bytes that should be passed as `mach_msg`'s `send_size`.
    pub fn send_size(&self) -> u32 {
        self.header().size
    }

    /// The exact bytes that would go out on the wire for this layout:
    /// `send_size()` bytes starting at the struct's first field. Used by
    /// [`MessageCodec::decode`]'s round-trip tests; actual sends go through
    /// `header_mut`/`send_size` with `mach_msg` directly.
    pub fn as_bytes(&self) -> &[u8] {
        let size = self.send_size() as usize;
        let ptr = match self {
            Self::Default32(r) => r as *const Request32 as *const u8,
            Self::Default64(r) => r as *const Request64 as *const u8,
            Self::State32(r) => r as *const RequestState32 as *const u8,
            Self::State64(r) => r as *const RequestState64 as *const u8,
            Self::StateIdentity32(r) => r as *const RequestStateIdentity32 as *const u8,
            Self::StateIdentity64(r) => r as *const RequestStateIdentity64 as *const u8,
        };
        // SAFETY: every variant is `#[repr(C, packed(4))]` plain old data,
        // and `size` never exceeds the variant's own `mem::size_of` (it is
        // either the fixed struct size or an offset within it).
        unsafe { std::slice::from_raw_parts(ptr, size) }
    }
}

/// Truncates a 64-bit Mach exception code to 32 bits by value cast. This
/// matches kernel behavior for legacy 32-bit-code handlers; forwarding to
/// one is a best-effort bridge and truncation is expected, not an error.
#[inline]
fn truncate(code: i64) -> i32 {
    code as i32
}

/// Copies the NDR record, exception kind, code count and (possibly
/// truncated) code values common to every layout, and stamps the
/// destination header's `id`/`size` for the fixed-size (non-state) layouts.
fn copy_common_32(dst_ndr: &mut NdrRecord, src: &RequestStateIdentity64) -> (i32, u32, [i32; 2]) {
    *dst_ndr = src.ndr;
    (src.exception, src.code_count, [truncate(src.code[0]), truncate(src.code[1])])
}

fn copy_common_64(dst_ndr: &mut NdrRecord, src: &RequestStateIdentity64) -> (i32, u32, [i64; 2]) {
    *dst_ndr = src.ndr;
    (src.exception, src.code_count, src.code)
}

/// Re-acquired thread state to splice into a forwarded state-carrying
/// request, captured in the *old* handler's flavor (see
/// `Forwarder::reacquire_state` in `mac::forward`).
pub struct ReacquiredState<'a> {
    pub flavor: ts::thread_state_flavor_t,
    pub words: &'a [u32],
}

fn copy_state_32(dst: &mut RequestState32, state: &ReacquiredState<'_>) {
    dst.flavor = state.flavor;
    dst.old_state_count = state.words.len() as u32;
    dst.old_state = [0; MAX_STATE_WORDS];
    dst.old_state[..state.words.len()].copy_from_slice(state.words);
    let size = mem::offset_of!(RequestState32, old_state) + state.words.len() * mem::size_of::<u32>();
    dst.header.size = size as u32;
}

fn copy_state_64(dst: &mut RequestState64, state: &ReacquiredState<'_>) {
    dst.flavor = state.flavor;
    dst.old_state_count = state.words.len() as u32;
    dst.old_state = [0; MAX_STATE_WORDS];
    dst.old_state[..state.words.len()].copy_from_slice(state.words);
    let size = mem::offset_of!(RequestState64, old_state) + state.words.len() * mem::size_of::<u32>();
    dst.header.size = size as u32;
}

fn copy_state_identity_32(dst: &mut RequestStateIdentity32, state: &ReacquiredState<'_>) {
    dst.flavor = state.flavor;
    dst.old_state_count = state.words.len() as u32;
    dst.old_state = [0; MAX_STATE_WORDS];
    dst.old_state[..state.words.len()].copy_from_slice(state.words);
    let size =
        mem::offset_of!(RequestStateIdentity32, old_state) + state.words.len() * mem::size_of::<u32>();
    dst.header.size = size as u32;
}

fn copy_state_identity_64(dst: &mut RequestStateIdentity64, state: &ReacquiredState<'_>) {
    dst.flavor = state.flavor;
    dst.old_state_count = state.words.len() as u32;
    dst.old_state = [0; MAX_STATE_WORDS];
    dst.old_state[..state.words.len()].copy_from_slice(state.words);
    let size =
        mem::offset_of!(RequestStateIdentity64, old_state) + state.words.len() * mem::size_of::<u32>();
    dst.header.size = size as u32;
}

/// Marshals the canonical request into whichever wire layout a previously
/// installed handler expects, and unmarshals a raw received message back
/// into its typed layout.
pub struct MessageCodec;

impl MessageCodec {
    /// Encodes `request` (the canonical, widest form this module receives)
    /// into the layout named by `behavior`, re-using `state` when the target
    /// family carries thread state.
    ///
    /// # Panics
    ///
    /// Panics if `behavior.family` is `State` or `StateIdentity` and `state`
    /// is `None` -- callers (the forwarder) always re-acquire state before
    /// calling this for those families.
    pub fn encode_as(
        behavior: Behavior,
        request: &RequestStateIdentity64,
        state: Option<ReacquiredState<'_>>,
    ) -> EncodedRequest {
        encode_as(behavior, request, state)
    }

    /// Unmarshals `bytes` -- exactly `msgh_size` bytes of a received (or
    /// otherwise captured) Mach message -- into whichever of the six wire
    /// layouts its `msgh_id` names, rejecting anything shorter than that
    /// layout's fixed header or longer than its maximum size.
    ///
    /// This is the decode half of `encode_as`: for every layout, encoding
    /// the canonical request as that layout and decoding the resulting bytes
    /// back recovers an equal value (spec §8's round-trip law, `encode(decode(m))
    /// == m`, read the other way since `encode_as` only ever starts from the
    /// canonical form).
    pub fn decode(bytes: &[u8]) -> Result<EncodedRequest, Error> {
        if bytes.len() < mem::size_of::<MachMsgHeader>() {
            return Err(Error::Malformed("message shorter than a mach_msg_header_t"));
        }
        // SAFETY: just checked `bytes` is at least one header long, and
        // `MachMsgHeader` is `#[repr(C, packed(4))]` plain old data.
        let id = unsafe { (*(bytes.as_ptr() as *const MachMsgHeader)).id };
        match id {
            MSG_ID_REQUEST_32 => decode_fixed::<Request32>(bytes).map(EncodedRequest::Default32),
            MSG_ID_REQUEST_64 => decode_fixed::<Request64>(bytes).map(EncodedRequest::Default64),
            MSG_ID_REQUEST_STATE_32 => {
                decode_state::<RequestState32>(bytes, mem::offset_of!(RequestState32, old_state))
                    .map(EncodedRequest::State32)
            }
            MSG_ID_REQUEST_STATE_64 => {
                decode_state::<RequestState64>(bytes, mem::offset_of!(RequestState64, old_state))
                    .map(EncodedRequest::State64)
            }
            MSG_ID_REQUEST_STATE_IDENTITY_32 => decode_state::<RequestStateIdentity32>(
                bytes,
                mem::offset_of!(RequestStateIdentity32, old_state),
            )
            .map(EncodedRequest::StateIdentity32),
            MSG_ID_REQUEST_STATE_IDENTITY_64 => decode_state::<RequestStateIdentity64>(
                bytes,
                mem::offset_of!(RequestStateIdentity64, old_state),
            )
            .map(EncodedRequest::StateIdentity64),
            _ => Err(Error::Malformed("unrecognized msg_id")),
        }
    }

    /// Unmarshals the canonical `REQUEST_STATE_IDENTITY_64` layout this
    /// module's own port receives (spec §4.2: "the core receives only
    /// `REQUEST_STATE_IDENTITY_64`"). A thin wrapper over [`Self::decode`]
    /// that rejects every other layout; this is what `HandlerLoop::receive`
    /// actually calls.
    pub fn decode_state_identity_64(bytes: &[u8]) -> Result<RequestStateIdentity64, Error> {
        match Self::decode(bytes)? {
            EncodedRequest::StateIdentity64(r) => Ok(r),
            _ => Err(Error::Malformed("expected REQUEST_STATE_IDENTITY_64")),
        }
    }
}

/// Reads a fixed-size (no thread-state tail) layout out of `bytes`, which
/// must be exactly `size_of::<T>()` long -- these layouts have no variable
/// trailing field, so anything else is malformed.
fn decode_fixed<T: Copy>(bytes: &[u8]) -> Result<T, Error> {
    if bytes.len() != mem::size_of::<T>() {
        return Err(Error::Malformed("fixed-size layout received with the wrong byte count"));
    }
    // SAFETY: length checked above; `T` is one of the `#[repr(C, packed(4))]`
    // request structs, plain old data with no padding-sensitive invariants.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// Reads a state-carrying layout out of `bytes`, which may be shorter than
/// `size_of::<T>()` -- the kernel only sends `old_state_count` words of the
/// `old_state` tail, not the full fixed-size array -- but never shorter than
/// `state_offset` (the offset of that tail), and never longer than the full
/// struct.
fn decode_state<T: Copy>(bytes: &[u8], state_offset: usize) -> Result<T, Error> {
    if bytes.len() < state_offset {
        return Err(Error::Malformed("state-carrying layout shorter than its fixed header"));
    }
    if bytes.len() > mem::size_of::<T>() {
        return Err(Error::Malformed("state-carrying layout longer than its maximum size"));
    }
    // SAFETY: zero-initializing `T` (plain old data, no `Drop`/pointers) then
    // copying a validated-length prefix of `bytes` over it leaves every
    // trailing `old_state` word not actually received as zero, matching a
    // `mach_msg` receive into an already-zeroed buffer.
    let mut value: T = unsafe { mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), (&mut value as *mut T).cast::<u8>(), bytes.len());
    }
    Ok(value)
}

fn encode_as(
    behavior: Behavior,
    request: &RequestStateIdentity64,
    state: Option<ReacquiredState<'_>>,
) -> EncodedRequest {
    // SAFETY: every field of every layout below is written explicitly before
    // use; zeroed() only gives us a valid bit pattern to start from for the
    // plain-old-data struct (no pointers, no Drop).
    unsafe {
        match (behavior.family, behavior.wide_codes) {
            (BehaviorFamily::Default, false) => {
                let mut r: Request32 = mem::zeroed();
                r.header = request.header;
                r.header.id = MSG_ID_REQUEST_32;
                r.header.size = mem::size_of::<Request32>() as u32;
                r.body = request.body;
                r.thread = request.thread;
                r.task = request.task;
                let (exception, code_count, code) = copy_common_32(&mut r.ndr, request);
                r.exception = exception;
                r.code_count = code_count;
                r.code = code;
                EncodedRequest::Default32(r)
            }
            (BehaviorFamily::Default, true) => {
                let mut r: Request64 = mem::zeroed();
                r.header = request.header;
                r.header.id = MSG_ID_REQUEST_64;
                r.header.size = mem::size_of::<Request64>() as u32;
                r.body = request.body;
                r.thread = request.thread;
                r.task = request.task;
                let (exception, code_count, code) = copy_common_64(&mut r.ndr, request);
                r.exception = exception;
                r.code_count = code_count;
                r.code = code;
                EncodedRequest::Default64(r)
            }
            (BehaviorFamily::State, false) => {
                let mut r: RequestState32 = mem::zeroed();
                r.header = request.header;
                r.header.id = MSG_ID_REQUEST_STATE_32;
                let (exception, code_count, code) = copy_common_32(&mut r.ndr, request);
                r.exception = exception;
                r.code_count = code_count;
                r.code = code;
                copy_state_32(&mut r, &state.expect("state family requires re-acquired state"));
                EncodedRequest::State32(r)
            }
            (BehaviorFamily::State, true) => {
                let mut r: RequestState64 = mem::zeroed();
                r.header = request.header;
                r.header.id = MSG_ID_REQUEST_STATE_64;
                let (exception, code_count, code) = copy_common_64(&mut r.ndr, request);
                r.exception = exception;
                r.code_count = code_count;
                r.code = code;
                copy_state_64(&mut r, &state.expect("state family requires re-acquired state"));
                EncodedRequest::State64(r)
            }
            (BehaviorFamily::StateIdentity, false) => {
                let mut r: RequestStateIdentity32 = mem::zeroed();
                r.header = request.header;
                r.header.id = MSG_ID_REQUEST_STATE_IDENTITY_32;
                r.body = request.body;
                r.thread = request.thread;
                r.task = request.task;
                let (exception, code_count, code) = copy_common_32(&mut r.ndr, request);
                r.exception = exception;
                r.code_count = code_count;
                r.code = code;
                copy_state_identity_32(&mut r, &state.expect("state family requires re-acquired state"));
                EncodedRequest::StateIdentity32(r)
            }
            (BehaviorFamily::StateIdentity, true) => {
                let mut r: RequestStateIdentity64 = *request;
                r.header.id = MSG_ID_REQUEST_STATE_IDENTITY_64;
                copy_state_identity_64(&mut r, &state.expect("state family requires re-acquired state"));
                EncodedRequest::StateIdentity64(r)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestStateIdentity64 {
        // SAFETY: plain old data, every field overwritten below.
        let mut r: RequestStateIdentity64 = unsafe { mem::zeroed() };
        r.header.id = MSG_ID_REQUEST_STATE_IDENTITY_64;
        r.header.size = mem::size_of::<RequestStateIdentity64>() as u32;
        r.exception = et::EXC_BAD_ACCESS as i32;
        r.code_count = 2;
        r.code = [KERN_PROTECTION_FAILURE as i64, 0x1_FFFF_FFFF_FFFF];
        r.thread.name = 11;
        r.task.name = 22;
        r.flavor = THREAD_STATE_NONE;
        r.old_state_count = 4;
        r.old_state[0] = 0xAAAA_BBBB;
        r
    }

    #[test]
    fn round_trip_64_to_64_preserves_everything() {
        let request = sample_request();
        let state = ReacquiredState {
            flavor: request.flavor,
            words: &request.old_state[..request.old_state_count as usize],
        };
        let encoded = MessageCodec::encode_as(
            Behavior { family: BehaviorFamily::StateIdentity, wide_codes: true, flavor: request.flavor },
            &request,
            Some(state),
        );

        match encoded {
            EncodedRequest::StateIdentity64(r) => {
                assert_eq!({ r.code[0] }, request.code[0]);
                assert_eq!({ r.code[1] }, request.code[1]);
                assert_eq!({ r.thread.name }, request.thread.name);
                assert_eq!({ r.task.name }, request.task.name);
                assert_eq!({ r.old_state[0] }, request.old_state[0]);
            }
            _ => panic!("wrong layout produced"),
        }
    }

    #[test]
    fn truncates_code_when_downgrading_to_32_bit_default() {
        let request = sample_request();
        let encoded = MessageCodec::encode_as(
            Behavior { family: BehaviorFamily::Default, wide_codes: false, flavor: 0 },
            &request,
            None,
        );

        match encoded {
            EncodedRequest::Default32(r) => {
                assert_eq!(r.header.id, MSG_ID_REQUEST_32);
                assert_eq!({ r.code[0] }, 1);
                assert_eq!({ r.code[1] }, 0xFFFF_FFFFu32 as i32);
                assert_eq!({ r.thread.name }, request.thread.name);
                assert_eq!({ r.task.name }, request.task.name);
            }
            _ => panic!("wrong layout produced"),
        }
    }

    #[test]
    fn state_identity_64_packing_matches_spec_size() {
        let size = mem::offset_of!(RequestStateIdentity64, old_state) + 224 * mem::size_of::<u32>();
        assert_eq!(size, mem::size_of::<RequestStateIdentity64>());
    }

    #[test]
    fn decode_then_reencode_round_trips_the_canonical_layout() {
        let request = sample_request();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &request as *const RequestStateIdentity64 as *const u8,
                request.header.size as usize,
            )
        };

        let decoded = MessageCodec::decode(bytes).expect("well-formed STATE_IDENTITY_64 should decode");
        match &decoded {
            EncodedRequest::StateIdentity64(_) => {}
            _ => panic!("wrong layout decoded"),
        }
        assert_eq!(decoded.as_bytes(), bytes, "encode(decode(m)) should reproduce m exactly");
    }

    #[test]
    fn decode_then_reencode_round_trips_a_fixed_size_layout() {
        // Default32 carries no thread state, so its wire bytes are its full
        // struct size -- no trailing state words to truncate.
        let encoded = MessageCodec::encode_as(
            Behavior { family: BehaviorFamily::Default, wide_codes: false, flavor: 0 },
            &sample_request(),
            None,
        );
        let bytes = encoded.as_bytes();

        let decoded = MessageCodec::decode(bytes).expect("well-formed REQUEST_32 should decode");
        match &decoded {
            EncodedRequest::Default32(_) => {}
            _ => panic!("wrong layout decoded"),
        }
        assert_eq!(decoded.as_bytes(), bytes, "encode(decode(m)) should reproduce m exactly");
    }

    #[test]
    fn decode_then_reencode_round_trips_a_state_layout_with_partial_state() {
        // Only 2 of the 224 possible words are actually declared -- the
        // kernel never sends the full fixed-size array, and decode must not
        // require it.
        let request = sample_request();
        let state = ReacquiredState { flavor: request.flavor, words: &request.old_state[..2] };
        let encoded = MessageCodec::encode_as(
            Behavior { family: BehaviorFamily::StateIdentity, wide_codes: true, flavor: request.flavor },
            &request,
            Some(state),
        );
        let bytes = encoded.as_bytes();
        assert!(
            bytes.len() < mem::size_of::<RequestStateIdentity64>(),
            "partial state should be shorter than the full fixed-size layout"
        );

        let decoded = MessageCodec::decode(bytes).expect("a partial state payload should still decode");
        assert_eq!(decoded.as_bytes(), bytes, "encode(decode(m)) should reproduce m exactly");
    }

    #[test]
    fn decode_rejects_unrecognized_msg_id() {
        let mut request = sample_request();
        request.header.id = 9999;
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &request as *const RequestStateIdentity64 as *const u8,
                request.header.size as usize,
            )
        };
        assert!(matches!(MessageCodec::decode(bytes), Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_rejects_a_message_shorter_than_any_header() {
        assert!(matches!(MessageCodec::decode(&[0u8; 4]), Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_state_identity_64_rejects_other_layouts() {
        let encoded = MessageCodec::encode_as(
            Behavior { family: BehaviorFamily::Default, wide_codes: false, flavor: 0 },
            &sample_request(),
            None,
        );
        let err = MessageCodec::decode_state_identity_64(encoded.as_bytes())
            .expect_err("a REQUEST_32 message is not REQUEST_STATE_IDENTITY_64");
        assert!(matches!(err, Error::Malformed(_)));
    }
}
