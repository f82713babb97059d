//! Process-wide runtime for the C entry points.
//!
//! The runtime is created at most once, either by `poolguard_init_runtime`
//! or lazily from the environment on the first entry point that needs it.
//! Initialization is an atomic state machine instead of a `OnceLock` so a
//! reentrant call made while the runtime is being built sees `None` and
//! passes through rather than waiting on itself.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use parking_lot::Mutex;
use poolguard_membrane::config::check_mode;
use poolguard_membrane::{LogDestination, PoolId, Runtime, RuntimeConfig};

#[cfg(target_os = "linux")]
use crate::fault_abi::install_fault_handler;

#[cfg(not(target_os = "linux"))]
fn install_fault_handler() -> bool {
    false
}

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_FAILED: u8 = 3;

static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME_PTR: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

/// Log destination requested before the runtime exists.
static PENDING_LOG: Mutex<Option<LogDestination>> = Mutex::new(None);

/// The runtime if it is ready; never initializes it.
pub(crate) fn ready() -> Option<&'static Runtime> {
    let ptr = RUNTIME_PTR.load(Ordering::Acquire);
    // SAFETY: once READY, RUNTIME_PTR points at a leaked Runtime that is never freed.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// Build the runtime from `config` if nobody has yet. Returns whether this
/// call performed the initialization.
pub(crate) fn install(mut config: RuntimeConfig) -> bool {
    if RUNTIME_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return false;
    }
    if let Some(log) = PENDING_LOG.lock().take() {
        config.log = log;
    }
    let fault_handler = config.fault_handler;
    match Runtime::new(config) {
        Ok(runtime) => {
            RUNTIME_PTR.store(Box::into_raw(Box::new(runtime)), Ordering::Release);
            RUNTIME_STATE.store(STATE_READY, Ordering::Release);
            if fault_handler {
                install_fault_handler();
            }
            true
        }
        Err(err) => {
            eprintln!("poolguard: runtime initialization failed: {err}");
            RUNTIME_STATE.store(STATE_FAILED, Ordering::Release);
            false
        }
    }
}

/// The process runtime, created from `POOLGUARD_*` on first use.
///
/// `None` while another call is initializing it or after initialization
/// failed; callers then pass their arguments through unchecked.
pub(crate) fn runtime() -> Option<&'static Runtime> {
    match RUNTIME_STATE.load(Ordering::Acquire) {
        STATE_READY => ready(),
        STATE_UNINIT => {
            install(RuntimeConfig::from_env().with_mode(check_mode()));
            ready()
        }
        _ => None,
    }
}

/// Remember a log destination for the runtime that is about to be created.
/// Fails once the runtime exists.
pub(crate) fn set_pending_log(dest: LogDestination) -> bool {
    if RUNTIME_STATE.load(Ordering::Acquire) != STATE_UNINIT {
        return false;
    }
    *PENDING_LOG.lock() = Some(dest);
    true
}

/// Pool handles cross the C boundary as opaque pointers holding the raw id.
pub(crate) fn pool_from_handle(handle: *mut std::ffi::c_void) -> Option<PoolId> {
    u32::try_from(handle as usize).ok().and_then(PoolId::from_raw)
}

pub(crate) fn handle_from_pool(pool: PoolId) -> *mut std::ffi::c_void {
    pool.raw() as usize as *mut std::ffi::c_void
}
