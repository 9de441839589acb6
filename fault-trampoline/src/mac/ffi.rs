//! Hand-rolled Mach exception message layouts.
//!
//! `mach_exc.defs`'s generated code (`mig -v /usr/include/mach/mach_exc.defs`)
//! calls its handler functions by name and falls over under hidden-symbol
//! link modes, so -- same as the C module this is ported from -- we define
//! our own copies of the six wire layouts instead of depending on vendor
//! headers for struct layout. See `original_source/code/protxc.c`'s
//! `REQUEST_RAISE_STRUCT` family of macros for the structs these were
//! expanded from.

pub use mach2::{
    exception_types as et,
    kern_return::{kern_return_t, KERN_FAILURE, KERN_SUCCESS},
    mach_init::mach_thread_self,
    mach_port as mp, mach_types as mt,
    message,
    port::{self, mach_port_t, MACH_PORT_NULL},
    task, thread_act, thread_status as ts,
    traps::mach_task_self,
};

/// Number of top level exception types (thread/task exception port arrays
/// are indexed up to this many slots).
pub const EXC_TYPES_COUNT: usize = 14;

/// Not exposed by `mach2`'s `kern_return` module; the value is stable ABI.
pub const KERN_PROTECTION_FAILURE: kern_return_t = 2;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 13;
    } else if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 5;
    }
}

/// Number of `natural_t` words in the largest thread state flavor we need
/// to be able to carry. Matches `old_state[224]` in
/// `original_source/code/protxc.c`.
pub const MAX_STATE_WORDS: usize = fault_context::MAX_STATE_WORDS;

/// Message ids that appear in request messages (determined by running `mig`
/// over `/usr/include/mach/exc.defs` and `mach_exc.defs`). Replies to these
/// are these + 100.
pub const MSG_ID_REQUEST_32: i32 = 2401;
pub const MSG_ID_REQUEST_STATE_32: i32 = 2402;
pub const MSG_ID_REQUEST_STATE_IDENTITY_32: i32 = 2403;
pub const MSG_ID_REQUEST_64: i32 = 2405;
pub const MSG_ID_REQUEST_STATE_64: i32 = 2406;
pub const MSG_ID_REQUEST_STATE_IDENTITY_64: i32 = 2407;

/// <https://github.com/apple-oss-distributions/xnu/blob/e6231be02a03711ca404e5121a151b24afbff733/osfmk/mach/ndr.h#L40-L49>
#[repr(C)]
#[derive(Copy, Clone)]
pub struct NdrRecord {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

/// <https://github.com/apple-oss-distributions/xnu/blob/e6231be02a03711ca404e5121a151b24afbff733/osfmk/mach/message.h#L545-L552>
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct MachMsgHeader {
    pub bits: u32,
    pub size: u32,
    pub remote_port: u32,
    pub local_port: u32,
    pub voucher_port: u32,
    pub id: i32,
}

/// <https://github.com/apple-oss-distributions/xnu/blob/e6231be02a03711ca404e5121a151b24afbff733/osfmk/mach/message.h#L379-L391>
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct MachMsgPortDescriptor {
    pub name: u32,
    __pad1: u32,
    __pad2: u16,
    __disposition: u8,
    __type: u8,
}

#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct MachMsgBody {
    pub descriptor_count: u32,
}

macro_rules! request_raise {
    ($name:ident, $code_ty:ty) => {
        /// Identity + no state, see `REQUEST_RAISE_STRUCT` in
        /// `original_source/code/protxc.c`.
        #[repr(C, packed(4))]
        #[derive(Copy, Clone)]
        pub struct $name {
            pub header: MachMsgHeader,
            pub body: MachMsgBody,
            pub thread: MachMsgPortDescriptor,
            pub task: MachMsgPortDescriptor,
            pub ndr: NdrRecord,
            pub exception: i32,
            pub code_count: u32,
            pub code: [$code_ty; 2],
        }
    };
}

macro_rules! request_raise_state {
    ($name:ident, $code_ty:ty) => {
        /// State, no identity, see `REQUEST_RAISE_STATE_STRUCT` in
        /// `original_source/code/protxc.c`.
        #[repr(C, packed(4))]
        #[derive(Copy, Clone)]
        pub struct $name {
            pub header: MachMsgHeader,
            pub ndr: NdrRecord,
            pub exception: i32,
            pub code_count: u32,
            pub code: [$code_ty; 2],
            pub flavor: i32,
            pub old_state_count: u32,
            pub old_state: [u32; MAX_STATE_WORDS],
        }
    };
}

macro_rules! request_raise_state_identity {
    ($name:ident, $code_ty:ty) => {
        /// State + identity, see `REQUEST_RAISE_STATE_IDENTITY_STRUCT` in
        /// `original_source/code/protxc.c`. The 64-bit-code variant of this
        /// is the canonical request form this module receives from the
        /// kernel.
        #[repr(C, packed(4))]
        #[derive(Copy, Clone)]
        pub struct $name {
            pub header: MachMsgHeader,
            pub body: MachMsgBody,
            pub thread: MachMsgPortDescriptor,
            pub task: MachMsgPortDescriptor,
            pub ndr: NdrRecord,
            pub exception: i32,
            pub code_count: u32,
            pub code: [$code_ty; 2],
            pub flavor: i32,
            pub old_state_count: u32,
            pub old_state: [u32; MAX_STATE_WORDS],
        }
    };
}

request_raise!(Request32, i32);
request_raise!(Request64, i64);
request_raise_state!(RequestState32, i32);
request_raise_state!(RequestState64, i64);
request_raise_state_identity!(RequestStateIdentity32, i32);
request_raise_state_identity!(RequestStateIdentity64, i64);

/// Whenever MIG detects an error it sends back a generic `mig_reply_error_t`;
/// clients must be ready to accept that shape too, but since this module
/// only ever builds the success/failure reply for the one behavior it
/// registers with, this is the one reply shape it produces.
#[repr(C, packed(4))]
#[derive(Copy, Clone)]
pub struct ReplyStateIdentity {
    pub header: MachMsgHeader,
    pub ndr: NdrRecord,
    pub ret_code: kern_return_t,
    pub flavor: i32,
    pub new_state_count: u32,
    pub new_state: [u32; MAX_STATE_WORDS],
}

impl ReplyStateIdentity {
    /// Offset of the `new_state` field, used to compute `msgh_size` for a
    /// reply that only carries `new_state_count` valid words rather than the
    /// full fixed-size array -- sending the full struct size causes the
    /// kernel to silently discard the state (see spec invariant on
    /// `msg_size`).
    pub const NEW_STATE_OFFSET: usize = std::mem::offset_of!(Self, new_state);
}

extern "C" {
    /// Set an exception handler for a thread on one or more exception types,
    /// returning the previously defined exception handlers for those types.
    ///
    /// <https://github.com/apple-oss-distributions/xnu/blob/e7776783b89a353188416a9a346c6cdb4928faad/osfmk/mach/thread_act.defs>
    pub fn thread_swap_exception_ports(
        thread: mt::thread_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
        masks: *mut et::exception_mask_t,
        masks_count: *mut u32,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut et::exception_behavior_t,
        old_flavors: *mut ts::thread_state_flavor_t,
    ) -> kern_return_t;

    /// Restore a single previously-recorded exception port registration for
    /// a thread.
    ///
    /// <https://github.com/apple-oss-distributions/xnu/blob/e7776783b89a353188416a9a346c6cdb4928faad/osfmk/mach/thread_act.defs>
    pub fn thread_set_exception_ports(
        thread: mt::thread_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
    ) -> kern_return_t;

    /// The NDR record describing this host's byte order/representation.
    ///
    /// <https://github.com/apple-oss-distributions/xnu/blob/e7776783b89a353188416a9a346c6cdb4928faad/osfmk/mach/i386/ndr_def.h#L36-L45>
    pub static NDR_record: NdrRecord;
}
