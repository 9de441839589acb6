//! Drives real protection faults through the trampoline: mmap a page,
//! drop its protection, install the trampoline, touch the page, and check
//! whether the resolver's decision steers the outcome the way the core is
//! supposed to (resume transparently, or escalate to the next handler).
//!
//! Crash scenarios reinvoke this same test binary as a child process
//! (mirroring the teacher's `tests/segv.rs`/`shared.rs` split) since a
//! genuinely unresolved access violation terminates the process, which a
//! normal `#[test]` can't survive to assert against.

#![cfg(target_os = "macos")]

use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fault_trampoline::{AccessMode, ExceptionPort, MutatorFaultContext};

struct Guard {
    addr: *mut libc::c_void,
    len: usize,
}

impl Guard {
    fn new() -> Self {
        let len = page_size();
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED, "mmap failed");
        Self { addr, len }
    }

    fn write_byte(&self) {
        unsafe { (self.addr as *mut u8).write_volatile(7) };
    }

    fn address(&self) -> u64 {
        self.addr as u64
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[test]
fn resolved_access_lifts_protection_and_resumes() {
    let guard = Guard::new();
    let resolved = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let target = guard.address();

    let resolved_cb = Arc::clone(&resolved);
    let calls_cb = Arc::clone(&calls);

    let port = ExceptionPort::setup(Box::new(
        move |_mode: AccessMode, ctx: &mut MutatorFaultContext| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            if ctx.address == target {
                unsafe {
                    libc::mprotect(
                        target as *mut libc::c_void,
                        page_size(),
                        libc::PROT_READ | libc::PROT_WRITE,
                    );
                }
                resolved_cb.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        },
    ))
    .expect("setup should succeed the first time in this process");

    guard.write_byte();

    assert!(resolved.load(Ordering::SeqCst), "resolver should have lifted the page's protection");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(port);
}

// Forwarding to a previously-installed handler (end-to-end scenario 5) is
// covered at the unit level instead of here: `mac::codec`'s round-trip
// tests exercise the re-encoding byte-for-byte, and `mac::forward`'s own
// tests cover behavior-family classification. Driving a *real* second
// Mach port acting as a previous handler from an integration test would
// duplicate significant internal plumbing for little extra confidence.

#[test]
fn unresolved_access_with_no_prior_handler_terminates_the_process() {
    const CHILD_ENV: &str = "FAULT_TRAMPOLINE_TEST_UNRESOLVED_CHILD";

    if std::env::var_os(CHILD_ENV).is_some() {
        let guard = Guard::new();
        let _port = ExceptionPort::setup(Box::new(|_mode: AccessMode, _ctx: &mut MutatorFaultContext| false))
            .expect("child process should be able to set up its own trampoline");
        guard.write_byte();
        unreachable!("an unresolved protection fault with no prior handler should have killed this process");
    }

    let exe = std::env::current_exe().expect("current_exe");
    let status = Command::new(exe)
        .arg("--exact")
        .arg("unresolved_access_with_no_prior_handler_terminates_the_process")
        .arg("--nocapture")
        .env(CHILD_ENV, "1")
        .status()
        .expect("failed to spawn child test process");

    use std::os::unix::process::ExitStatusExt;
    assert_eq!(status.signal(), Some(libc::SIGSEGV), "child should have died with SIGSEGV, got {status:?}");
}

#[test]
fn setup_is_idempotent_under_concurrent_callers() {
    const CHILD_ENV: &str = "FAULT_TRAMPOLINE_TEST_IDEMPOTENT_CHILD";

    if std::env::var_os(CHILD_ENV).is_some() {
        let first = ExceptionPort::setup(Box::new(|_mode: AccessMode, _ctx: &mut MutatorFaultContext| true));
        assert!(first.is_ok(), "first setup in a fresh process must succeed");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                std::thread::spawn(|| {
                    ExceptionPort::setup(Box::new(|_mode: AccessMode, _ctx: &mut MutatorFaultContext| true))
                        .is_err()
                })
            })
            .collect();

        let all_already_installed = handles.into_iter().all(|h| h.join().unwrap());
        assert!(all_already_installed, "every concurrent re-setup should observe AlreadyInstalled");
        return;
    }

    let exe = std::env::current_exe().expect("current_exe");
    let status = Command::new(exe)
        .arg("--exact")
        .arg("setup_is_idempotent_under_concurrent_callers")
        .arg("--nocapture")
        .env(CHILD_ENV, "1")
        .status()
        .expect("failed to spawn child test process");
    assert!(status.success());
}
