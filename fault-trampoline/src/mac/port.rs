//! `ExceptionPort`: the process-wide Mach receive port and handler thread,
//! plus the per-thread record of whichever exception port a mutator thread
//! had installed before this trampoline took it over.
//!
//! Grounded on `crash-handler/src/mac/state.rs`'s `HANDLER`/`attach`, split
//! into task-level setup and per-thread registration as two operations --
//! the `protSetup`/`protThreadRegister` split in
//! `original_source/code/protxc.c`, which registers per-thread rather than
//! per-task so that non-mutator threads keep their own debugger/signal
//! handlers intact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;

use super::ffi::*;
use super::handler_loop;
use crate::{Error, ResolveAccess};

/// Mask for the single exception type this trampoline services.
pub const EXCEPTION_MASK: et::exception_mask_t = 1 << et::EXC_BAD_ACCESS;

/// The behavior this trampoline registers its own port with: state +
/// identity, 64-bit (`MACH_EXCEPTION_CODES`) codes -- the canonical, widest
/// form spec §4.2 calls `REQUEST_STATE_IDENTITY_64`.
const OWN_BEHAVIOR: et::exception_behavior_t =
    et::EXCEPTION_STATE_IDENTITY | et::MACH_EXCEPTION_CODES as et::exception_behavior_t;

/// A previously-installed handler's registration for one thread, recorded
/// at the moment this trampoline swaps it out so the Forwarder can
/// re-encode messages for it later. `port == MACH_PORT_NULL` means there
/// was no previous handler.
#[derive(Copy, Clone)]
pub struct PreviousPort {
    pub port: mach_port_t,
    pub behavior: et::exception_behavior_t,
    pub flavor: ts::thread_state_flavor_t,
}

struct Inner {
    exception_port: mach_port_t,
    handler_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    setup_thread: mt::thread_t,
    previous: RwLock<HashMap<mt::thread_t, PreviousPort>>,
}

static STATE: RwLock<Option<Inner>> = RwLock::new(None);

fn not_initialized() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "fault trampoline has not been set up",
    ))
}

fn kern_result(kr: kern_return_t) -> Result<(), Error> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::from_raw_os_error(kr)))
    }
}

/// Allocates the exception port, spawns the handler thread, and registers
/// the calling thread as the first mutator. Idempotent: every call after
/// the first returns [`Error::AlreadyInstalled`] without touching global
/// state, so concurrent callers observe a single, fully-initialized
/// subsystem.
pub fn setup(resolver: Box<dyn ResolveAccess>) -> Result<(), Error> {
    let mut state = STATE.write();
    if state.is_some() {
        return Err(Error::AlreadyInstalled);
    }

    let task = unsafe { mach_task_self() };
    let mut port: mach_port_t = MACH_PORT_NULL;
    kern_result(unsafe { mp::mach_port_allocate(task, port::MACH_PORT_RIGHT_RECEIVE, &mut port) })?;
    // A send right on the same name lets the handler thread hand the port
    // out to re-delivery paths (e.g. forwarding back a reply) without a
    // second allocation.
    kern_result(unsafe {
        mp::mach_port_insert_right(task, port, port, message::MACH_MSG_TYPE_MAKE_SEND)
    })?;

    let resolver: Arc<dyn ResolveAccess> = Arc::from(resolver);
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_thread = handler_loop::spawn(port, resolver, Arc::clone(&shutdown));

    let setup_thread = unsafe { mach_thread_self() };
    let previous = match swap_exception_ports(setup_thread, port) {
        Ok(p) => p,
        Err(e) => {
            shutdown.store(true, Ordering::Release);
            let _ = handler_thread.join();
            return Err(e);
        }
    };

    let mut previous_map = HashMap::new();
    previous_map.insert(setup_thread, previous);

    *state = Some(Inner {
        exception_port: port,
        handler_thread: Some(handler_thread),
        shutdown,
        setup_thread,
        previous: RwLock::new(previous_map),
    });

    Ok(())
}

/// Registers the calling thread as a mutator, swapping its `EXC_BAD_ACCESS`
/// port to this trampoline's port and recording whatever was previously
/// installed. A no-op if the calling thread is the setup thread (registered
/// implicitly by [`setup`]) or has already been registered.
pub fn register_thread(is_setup_thread: bool) -> Result<(), Error> {
    let state = STATE.read();
    let inner = state.as_ref().ok_or_else(not_initialized)?;

    let current = unsafe { mach_thread_self() };
    if !is_setup_thread && current == inner.setup_thread {
        return Ok(());
    }
    if inner.previous.read().contains_key(&current) {
        return Ok(());
    }

    let previous = swap_exception_ports(current, inner.exception_port)?;
    inner.previous.write().insert(current, previous);
    Ok(())
}

/// Looks up the previously-installed handler for the thread named in a
/// received exception message, for the Forwarder. Returns `None` if that
/// thread was never registered through this module (shouldn't happen for
/// messages this port receives, but the Forwarder treats it the same as
/// "no previous handler").
pub fn previous_port_for(thread: mt::thread_t) -> Option<PreviousPort> {
    let state = STATE.read();
    let inner = state.as_ref()?;
    inner.previous.read().get(&thread).copied()
}

/// The task this trampoline was set up in, for the HandlerLoop's `task`
/// assertion (spec step 2: "`task` matches current task").
pub fn owning_task() -> mt::task_t {
    unsafe { mach_task_self() }
}

fn swap_exception_ports(
    thread: mt::thread_t,
    new_port: mach_port_t,
) -> Result<PreviousPort, Error> {
    let mut masks = [0u32; EXC_TYPES_COUNT];
    let mut old_handlers = [MACH_PORT_NULL; EXC_TYPES_COUNT];
    let mut old_behaviors = [0 as et::exception_behavior_t; EXC_TYPES_COUNT];
    let mut old_flavors = [0 as ts::thread_state_flavor_t; EXC_TYPES_COUNT];
    let mut masks_count = EXC_TYPES_COUNT as u32;

    kern_result(unsafe {
        thread_swap_exception_ports(
            thread,
            EXCEPTION_MASK,
            new_port,
            OWN_BEHAVIOR,
            THREAD_STATE_NONE,
            masks.as_mut_ptr(),
            &mut masks_count,
            old_handlers.as_mut_ptr(),
            old_behaviors.as_mut_ptr(),
            old_flavors.as_mut_ptr(),
        )
    })?;

    if masks_count == 0 {
        return Ok(PreviousPort { port: MACH_PORT_NULL, behavior: OWN_BEHAVIOR, flavor: THREAD_STATE_NONE });
    }
    Ok(PreviousPort { port: old_handlers[0], behavior: old_behaviors[0], flavor: old_flavors[0] })
}

/// Restores every registered thread's previous exception port and signals
/// the handler thread to exit. There is no teardown path in the core --
/// production embedders never call this -- but tests attach/detach
/// repeatedly within one process and need it to avoid leaking ports and
/// threads between cases.
pub fn teardown() {
    let mut state = STATE.write();
    let Some(mut inner) = state.take() else { return };

    for (&thread, previous) in inner.previous.get_mut().iter() {
        // SAFETY: best-effort restoration on a thread that is still alive
        // for the duration of the owning `ExceptionPort`; failures here
        // have no error channel to report through.
        unsafe {
            thread_set_exception_ports(
                thread,
                EXCEPTION_MASK,
                previous.port,
                previous.behavior,
                previous.flavor,
            );
        }
    }

    inner.shutdown.store(true, Ordering::Release);
    if let Some(handle) = inner.handler_thread.take() {
        let _ = handle.join();
    }
}
