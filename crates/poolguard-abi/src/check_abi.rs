//! ABI layer for the bounds and dereference checks.
//!
//! Every check returns the pointer the program should continue with: the
//! input when it is valid, a token when an out-of-bounds result was
//! rewritten, or the real pointer when a token re-enters its object. When
//! the runtime is unavailable the input comes back unchanged.

use std::ffi::{c_char, c_uint, c_void};

use poolguard_membrane::{CheckOutcome, CheckSite, Runtime, RuntimeError};

use crate::pool_abi::source_file;
use crate::runtime_state::{pool_from_handle, runtime};

fn resolve(
    fallback: usize,
    check: impl FnOnce(&Runtime) -> Result<CheckOutcome, RuntimeError>,
) -> *mut c_void {
    let Some(rt) = runtime() else {
        return fallback as *mut c_void;
    };
    match check(rt) {
        Ok(outcome) => outcome.pointer() as *mut c_void,
        Err(err) => {
            eprintln!("poolguard: check failed: {err}");
            fallback as *mut c_void
        }
    }
}

/// Check `result` against a statically sized object of `size` bytes at `base`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_exact_check(
    base: *mut c_void,
    result: *mut c_void,
    size: usize,
) -> *mut c_void {
    resolve(result as usize, |rt| {
        Ok(rt.exact_check(base as usize, result as usize, size, &CheckSite::new()))
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_exact_check_deref(
    base: *mut c_void,
    result: *mut c_void,
    size: usize,
    len: usize,
) -> *mut c_void {
    resolve(result as usize, |rt| {
        Ok(rt.exact_check_deref(base as usize, result as usize, size, len, &CheckSite::new()))
    })
}

/// Check pointer arithmetic `result = base + offset` within `pool`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_bounds_check(
    pool: *mut c_void,
    base: *mut c_void,
    result: *mut c_void,
) -> *mut c_void {
    resolve(result as usize, |rt| {
        rt.check_bounds(pool_from_handle(pool), base as usize, result as usize, &CheckSite::new())
    })
}

/// Bounds check at a site whose pool may hold objects the runtime never saw.
/// Unknown pointers pass.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_bounds_check_ui(
    pool: *mut c_void,
    base: *mut c_void,
    result: *mut c_void,
) -> *mut c_void {
    resolve(result as usize, |rt| {
        rt.check_bounds(
            pool_from_handle(pool),
            base as usize,
            result as usize,
            &CheckSite::incomplete(),
        )
    })
}

/// Bounds check that attributes a violation to `file:line`.
///
/// # Safety
///
/// `file` is null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_bounds_check_debug(
    pool: *mut c_void,
    base: *mut c_void,
    result: *mut c_void,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = CheckSite::new().with_source(unsafe { source_file(file) }, line);
    resolve(result as usize, |rt| {
        rt.check_bounds(pool_from_handle(pool), base as usize, result as usize, &site)
    })
}

/// Check a `len`-byte load or store at `ptr`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_check_deref(
    pool: *mut c_void,
    ptr: *mut c_void,
    len: usize,
) -> *mut c_void {
    resolve(ptr as usize, |rt| {
        rt.check_deref(pool_from_handle(pool), ptr as usize, len, &CheckSite::new())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_check_deref_ui(
    pool: *mut c_void,
    ptr: *mut c_void,
    len: usize,
) -> *mut c_void {
    resolve(ptr as usize, |rt| {
        rt.check_deref(pool_from_handle(pool), ptr as usize, len, &CheckSite::incomplete())
    })
}

/// Check that `ptr` sits `offset` bytes into an element of `pool`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_check_align(
    pool: *mut c_void,
    ptr: *mut c_void,
    offset: c_uint,
) -> *mut c_void {
    resolve(ptr as usize, |rt| {
        rt.check_align(pool_from_handle(pool), ptr as usize, offset as usize, &CheckSite::new())
    })
}

/// Alignment check at a site whose pool may hold objects the runtime never
/// saw. Unknown pointers pass.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_check_align_ui(
    pool: *mut c_void,
    ptr: *mut c_void,
    offset: c_uint,
) -> *mut c_void {
    resolve(ptr as usize, |rt| {
        rt.check_align(
            pool_from_handle(pool),
            ptr as usize,
            offset as usize,
            &CheckSite::incomplete(),
        )
    })
}

/// Collect a null-terminated list of function addresses.
///
/// # Safety
///
/// `targets` is null or points at a null-terminated array of pointers.
unsafe fn call_targets(targets: *const *const c_void) -> Vec<usize> {
    let mut out = Vec::new();
    if targets.is_null() {
        return out;
    }
    for i in 0.. {
        // SAFETY: caller guarantees the array is readable up to its terminator.
        let target = unsafe { *targets.add(i) };
        if target.is_null() {
            break;
        }
        out.push(target as usize);
    }
    out
}

/// Check an indirect call through `f` against the null-terminated list of
/// permitted `targets`. Returns `f`.
///
/// # Safety
///
/// `targets` is null or points at a null-terminated array of pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_funccheck(
    f: *mut c_void,
    targets: *const *const c_void,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let allowed = unsafe { call_targets(targets) };
    resolve(f as usize, |rt| {
        Ok(rt.check_call_target(f as usize, &allowed, &CheckSite::new()))
    })
}

/// `poolguard_funccheck` for target lists that may be incomplete. Every
/// call passes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_funccheck_ui(
    f: *mut c_void,
    _targets: *const *const c_void,
) -> *mut c_void {
    resolve(f as usize, |rt| {
        Ok(rt.check_call_target(f as usize, &[], &CheckSite::incomplete()))
    })
}

/// The real pointer behind a token. Non-token values come back unchanged;
/// call this before handing a pointer to uninstrumented code.
///
/// Tokens are unique across pools, so `_pool` only documents the call site.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_get_actual_value(
    _pool: *mut c_void,
    ptr: *mut c_void,
) -> *mut c_void {
    match runtime() {
        Some(rt) => rt.get_actual_value(ptr as usize) as *mut c_void,
        None => ptr,
    }
}

/// Report a hardware fault at `addr` and return the violation kind's CWE
/// number. A signal handler installed by the program calls this.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_report_fault(addr: *mut c_void, pc: usize) -> u32 {
    runtime().map_or(0, |rt| rt.report_fault(addr as usize, pc).cwe)
}
