// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::if_let_mutex,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_stack_arrays,
    clippy::let_unit_value,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::ptr_as_ptr,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::todo,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions: this whole crate is syscalls
#![allow(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;

pub use error::Error;
pub use fault_context::{AccessMode, MutatorFaultContext};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        $crate::write_stderr(concat!($s, "\n"));
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes a string directly to stderr via a raw `write(2)`, safe to call
/// from the handler thread while a mutator is suspended.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        #[cfg(target_os = "windows")]
        libc::write(2, s.as_ptr().cast(), s.len() as u32);

        #[cfg(not(target_os = "windows"))]
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// The collector's single upcall: given the context of a fault, decide
/// whether the access is now legal (protection lifted, object scanned,
/// barrier discharged) and resume is safe.
///
/// Called on the handler thread while the faulting mutator thread is
/// suspended by the kernel (macOS) or itself (Windows, synchronously). Must
/// not touch the faulting thread's user stack or any lock the faulting
/// thread could be holding.
pub trait ResolveAccess: Send + Sync {
    /// `mode` is a best-effort hint; both `Read` and `Write` barriers are
    /// serviced by the same upcall, matching spec: "single upcall —
    /// `resolve_access(addr, thread_state) -> handled?`".
    fn resolve_access(&self, mode: AccessMode, ctx: &mut MutatorFaultContext) -> bool;
}

impl<F> ResolveAccess for F
where
    F: Fn(AccessMode, &mut MutatorFaultContext) -> bool + Send + Sync,
{
    fn resolve_access(&self, mode: AccessMode, ctx: &mut MutatorFaultContext) -> bool {
        self(mode, ctx)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod mac;
        pub use mac::ExceptionPort;
    } else if #[cfg(target_os = "windows")] {
        pub mod windows;
    }
}
