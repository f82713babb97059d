//! SIGSEGV/SIGBUS handler for accesses through protected shadow pages.
//!
//! Every fault is reported through the runtime. A fault on the shadow of a
//! freed object exposes that shadow and returns, so the access is retried and
//! the program keeps running. Any other fault puts back the handler that was
//! installed before ours and returns; the retried access then faults under
//! it.

use std::ffi::{c_int, c_void};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use poolguard_membrane::FaultResolution;

use crate::runtime_state::ready;

const SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Actions that were in place for [`SIGNALS`] before ours.
static PREVIOUS: OnceLock<[libc::sigaction; 2]> = OnceLock::new();

fn empty_action() -> libc::sigaction {
    // SAFETY: sigaction is plain data; all-zero is SIG_DFL with an empty mask.
    unsafe { std::mem::zeroed() }
}

/// Install the fault handler once per process. Returns whether this call
/// installed it.
pub(crate) fn install_fault_handler() -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }
    let mut action = empty_action();
    action.sa_sigaction = on_fault as extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void)
        as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    // SAFETY: sa_mask is a valid sigset_t owned by `action`.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    let mut previous = [empty_action(); 2];
    for (old, &sig) in previous.iter_mut().zip(&SIGNALS) {
        // SAFETY: both pointers reference initialized sigaction values.
        if unsafe { libc::sigaction(sig, &action, old) } != 0 {
            eprintln!("poolguard: cannot install the handler for signal {sig}");
            return false;
        }
    }
    let _ = PREVIOUS.set(previous);
    true
}

/// Put back the action that was in place before ours for `sig`.
fn restore(sig: c_int) {
    let mut action = SIGNALS
        .iter()
        .position(|&s| s == sig)
        .and_then(|i| PREVIOUS.get().map(|previous| previous[i]))
        .unwrap_or_else(empty_action);
    // An ignored fault would be retried forever.
    if action.sa_sigaction == libc::SIG_IGN {
        action = empty_action();
    }
    // SAFETY: `action` is a fully initialized sigaction.
    unsafe { libc::sigaction(sig, &action, std::ptr::null_mut()) };
}

extern "C" fn on_fault(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo to SA_SIGINFO handlers.
        unsafe { (*info).si_addr() as usize }
    };
    let pc = fault_pc(ctx);
    let resume = ready().is_some_and(|rt| {
        let resolution = rt.handle_fault(addr, pc);
        rt.flush();
        resolution == FaultResolution::Resume
    });
    if !resume {
        restore(sig);
    }
}

#[cfg(target_arch = "x86_64")]
fn fault_pc(ctx: *mut c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    // SAFETY: the third argument of an SA_SIGINFO handler is a ucontext_t.
    let uc = unsafe { &*ctx.cast::<libc::ucontext_t>() };
    uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
}

#[cfg(target_arch = "aarch64")]
fn fault_pc(ctx: *mut c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    // SAFETY: the third argument of an SA_SIGINFO handler is a ucontext_t.
    let uc = unsafe { &*ctx.cast::<libc::ucontext_t>() };
    uc.uc_mcontext.pc as usize
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn fault_pc(_ctx: *mut c_void) -> usize {
    0
}

/// Install the fault handler if the runtime did not already. Returns 0 when
/// the handler is in place.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_install_fault_handler() -> c_int {
    if install_fault_handler() || PREVIOUS.get().is_some() { 0 } else { -1 }
}
