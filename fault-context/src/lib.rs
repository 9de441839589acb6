// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::explicit_into_iter_loop,
    clippy::filter_map_next,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
#![doc = include_str!("../README.md")]

bitflags::bitflags! {
    /// Which kind of access was attempted against a protected page.
    ///
    /// A set, not an enum: Mach can't distinguish a read from a write trap
    /// at all, so the Mach bridge passes both bits at once, exactly as
    /// `original_source/code/protxc.c`'s `catch_bad_access` passes
    /// `AccessREAD | AccessWRITE` to `ArenaAccess` verbatim. Windows delivers
    /// a single disambiguated bit in `EXCEPTION_RECORD::ExceptionInformation[0]`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AccessMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod mac;
        pub use mac::{MutatorFaultContext, MAX_STATE_WORDS};
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        pub use windows::MutatorFaultContext;
    }
}
