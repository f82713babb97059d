//! ABI layer for pools and object registration.
//!
//! Pool handles are opaque: a null handle names the external registry used
//! for objects that belong to no pool. Every entry point degrades to a no-op
//! (or a null allocation) when the runtime is unavailable.

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};

use poolguard_membrane::{
    CallSite, FrameMark, LogDestination, ObjectClass, ObjectMeta, PoolId, Provenance,
    RuntimeConfig, SourceLoc,
};

use crate::runtime_state::{
    handle_from_pool, install, pool_from_handle, runtime, set_pending_log,
};

/// Read a caller-supplied source file name, tolerating null.
///
/// # Safety
///
/// `file` is null or a NUL-terminated string.
pub(crate) unsafe fn source_file(file: *const c_char) -> String {
    if file.is_null() {
        return String::from("<unknown>");
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    unsafe { CStr::from_ptr(file) }.to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// runtime setup
// ---------------------------------------------------------------------------

/// Create the runtime with explicit feature flags. Returns 0 on success and
/// -1 when a runtime already exists or could not be built.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_init_runtime(
    dangling: c_int,
    rewrite_oob: c_int,
    terminate: c_int,
) -> c_int {
    let config =
        RuntimeConfig::from_env().with_flags(dangling != 0, rewrite_oob != 0, terminate != 0);
    if install(config) { 0 } else { -1 }
}

/// Send violation reports to `path` (`"stderr"`, `"off"`, or a file name).
/// Must be called before the runtime is created.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_init_logfile(path: *const c_char) -> c_int {
    if path.is_null() {
        return -1;
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    let raw = unsafe { CStr::from_ptr(path) }.to_string_lossy();
    if set_pending_log(LogDestination::from_str_loose(&raw)) { 0 } else { -1 }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_flush_log() {
    if let Some(rt) = runtime() {
        rt.flush();
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_violation_count() -> u64 {
    runtime().map_or(0, |rt| rt.violation_count())
}

// ---------------------------------------------------------------------------
// pools
// ---------------------------------------------------------------------------

/// Create a pool for objects of `node_size` bytes. Returns null on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_init(node_size: usize) -> *mut c_void {
    let Some(rt) = runtime() else {
        return std::ptr::null_mut();
    };
    match rt.create_pool(node_size) {
        Ok(pool) => handle_from_pool(pool),
        Err(err) => {
            eprintln!("poolguard: pool_init({node_size}) failed: {err}");
            std::ptr::null_mut()
        }
    }
}

/// Release every page of `pool`. Its objects and tokens are forgotten.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_destroy(pool: *mut c_void) {
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return;
    };
    if let Err(err) = rt.destroy_pool(id) {
        eprintln!("poolguard: pool_destroy failed: {err}");
    }
}

fn alloc_with(pool: *mut c_void, bytes: usize, site: &CallSite) -> *mut c_void {
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return std::ptr::null_mut();
    };
    match rt.alloc_at(id, bytes, site) {
        Ok(addr) => addr as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

fn free_with(pool: *mut c_void, ptr: *mut c_void, site: &CallSite) {
    if ptr.is_null() {
        return;
    }
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return;
    };
    // Rejected frees were already reported by the runtime.
    if let Err(err) = rt.free_at(id, ptr as usize, site) {
        eprintln!("poolguard: pool_free failed: {err}");
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_alloc(pool: *mut c_void, bytes: usize) -> *mut c_void {
    alloc_with(pool, bytes, &CallSite::default())
}

/// `poolguard_pool_alloc` that records the allocation site for reports.
///
/// # Safety
///
/// `file` is null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_src_pool_alloc(
    pool: *mut c_void,
    bytes: usize,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let file = unsafe { source_file(file) };
    alloc_with(pool, bytes, &CallSite::default().with_source(file, line))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_calloc(
    pool: *mut c_void,
    count: usize,
    size: usize,
) -> *mut c_void {
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return std::ptr::null_mut();
    };
    match rt.calloc(id, count, size) {
        Ok(addr) => addr as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_realloc(
    pool: *mut c_void,
    ptr: *mut c_void,
    bytes: usize,
) -> *mut c_void {
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return std::ptr::null_mut();
    };
    match rt.realloc(id, ptr as usize, bytes) {
        Ok(addr) => addr as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Duplicate `s` into `pool`. Returns null for a null string or on failure.
///
/// # Safety
///
/// `s` is null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_strdup(pool: *mut c_void, s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return std::ptr::null_mut();
    }
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return std::ptr::null_mut();
    };
    // SAFETY: caller guarantees a NUL-terminated string.
    let s = unsafe { CStr::from_ptr(s) };
    match rt.strdup(id, s) {
        Ok(addr) => addr as *mut c_char,
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_pool_free(pool: *mut c_void, ptr: *mut c_void) {
    free_with(pool, ptr, &CallSite::default());
}

/// `poolguard_pool_free` that records the free site for reports.
///
/// # Safety
///
/// `file` is null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_src_pool_free(
    pool: *mut c_void,
    ptr: *mut c_void,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let file = unsafe { source_file(file) };
    free_with(pool, ptr, &CallSite::default().with_source(file, line));
}

/// Allocate a stack object promoted to `pool`. It stays registered until
/// `poolguard_stack_release` pops its frame or the pool is destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_stack_alloc(pool: *mut c_void, bytes: usize) -> *mut c_void {
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return std::ptr::null_mut();
    };
    match rt.stack_alloc(id, bytes) {
        Ok(addr) => addr as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Promoted-stack position of a pool, saved on function entry and handed
/// back to `poolguard_stack_release` on exit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolguardFrameMark {
    pub depth: usize,
    pub top: usize,
    pub objects: usize,
}

/// Save the promoted-stack position of `pool` into `out`. Returns 0 on
/// success and -1 for a null `out` or an unknown pool.
///
/// # Safety
///
/// `out` is null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_stack_mark(
    pool: *mut c_void,
    out: *mut PoolguardFrameMark,
) -> c_int {
    if out.is_null() {
        return -1;
    }
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return -1;
    };
    let Ok(mark) = rt.stack_mark(id) else {
        return -1;
    };
    let [depth, top, objects] = mark.to_raw();
    // SAFETY: caller guarantees `out` is writable.
    unsafe {
        out.write(PoolguardFrameMark {
            depth,
            top,
            objects,
        });
    }
    0
}

/// Pop every stack object of `pool` allocated after `mark` was saved.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_stack_release(pool: *mut c_void, mark: PoolguardFrameMark) {
    let (Some(rt), Some(id)) = (runtime(), pool_from_handle(pool)) else {
        return;
    };
    let mark = FrameMark::from_raw([mark.depth, mark.top, mark.objects]);
    if let Err(err) = rt.stack_release(id, mark) {
        eprintln!("poolguard: stack_release failed: {err}");
    }
}

// ---------------------------------------------------------------------------
// registration
// ---------------------------------------------------------------------------

fn register_meta(pool: *mut c_void, start: *mut c_void, len: usize, meta: ObjectMeta) {
    let Some(rt) = runtime() else {
        return;
    };
    let id: Option<PoolId> = pool_from_handle(pool);
    if let Err(err) = rt.register_with(id, start as usize, len, meta) {
        eprintln!("poolguard: register failed: {err}");
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_register(pool: *mut c_void, start: *mut c_void, len: usize) {
    register_meta(pool, start, len, ObjectMeta::new(ObjectClass::Heap));
}

/// Register a heap object and remember where it was allocated.
///
/// # Safety
///
/// `file` is null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_register_debug(
    pool: *mut c_void,
    start: *mut c_void,
    len: usize,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let file = unsafe { source_file(file) };
    let provenance = Provenance {
        alloc_site: Some(SourceLoc::new(file, line)),
        ..Provenance::default()
    };
    register_meta(
        pool,
        start,
        len,
        ObjectMeta::new(ObjectClass::Heap).with_provenance(provenance),
    );
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_register_stack(
    pool: *mut c_void,
    start: *mut c_void,
    len: usize,
) {
    register_meta(pool, start, len, ObjectMeta::new(ObjectClass::Stack));
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_register_global(
    pool: *mut c_void,
    start: *mut c_void,
    len: usize,
) {
    register_meta(pool, start, len, ObjectMeta::new(ObjectClass::Global));
}

/// Move a registration after a `realloc` the runtime did not perform.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_reregister(
    pool: *mut c_void,
    new: *mut c_void,
    old: *mut c_void,
    len: usize,
) {
    let Some(rt) = runtime() else {
        return;
    };
    if let Err(err) = rt.reregister(pool_from_handle(pool), new as usize, old as usize, len) {
        eprintln!("poolguard: reregister failed: {err}");
    }
}

#[cfg(unix)]
unsafe extern "C" {
    static environ: *const *const c_char;
}

/// Register `count` strings of a null-terminated string array, then the
/// array itself, as external globals.
///
/// # Safety
///
/// `array` holds at least `count` entries followed by a null entry; every
/// non-null entry is a NUL-terminated string.
unsafe fn register_string_array(array: *const *const c_char, count: usize) {
    for i in 0..count {
        // SAFETY: caller guarantees `count` readable entries.
        let s = unsafe { *array.add(i) };
        if s.is_null() {
            continue;
        }
        // SAFETY: caller guarantees NUL-terminated entries.
        let len = unsafe { CStr::from_ptr(s) }.to_bytes_with_nul().len();
        register_meta(
            std::ptr::null_mut(),
            s.cast_mut().cast(),
            len,
            ObjectMeta::new(ObjectClass::Global),
        );
    }
    let array_len = (count + 1) * std::mem::size_of::<*const c_char>();
    register_meta(
        std::ptr::null_mut(),
        array.cast_mut().cast(),
        array_len,
        ObjectMeta::new(ObjectClass::Global),
    );
}

/// Register the argument strings, the `argv` array and the environment as
/// external objects so checks on them pass. Returns `argv`.
///
/// # Safety
///
/// `argv` is null or holds `argc` NUL-terminated strings followed by a null
/// entry, as handed to `main`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_argv_register(
    argc: c_int,
    argv: *mut *mut c_char,
) -> *mut *mut c_char {
    if argv.is_null() {
        return argv;
    }
    let count = usize::try_from(argc).unwrap_or(0);
    // SAFETY: forwarded caller contract.
    unsafe { register_string_array(argv.cast_const().cast(), count) };

    #[cfg(unix)]
    {
        // SAFETY: environ is the process environment, terminated by a null entry.
        let env = unsafe { environ };
        if !env.is_null() {
            // SAFETY: entries are readable up to the terminator.
            let count = (0..)
                .take_while(|&i| !unsafe { *env.add(i) }.is_null())
                .count();
            // SAFETY: environ entries are NUL-terminated strings.
            unsafe { register_string_array(env, count) };
        }
    }
    argv
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_unregister(pool: *mut c_void, start: *mut c_void) {
    let Some(rt) = runtime() else {
        return;
    };
    if let Err(err) = rt.unregister(pool_from_handle(pool), start as usize) {
        eprintln!("poolguard: unregister failed: {err}");
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolguard_unregister_stack(pool: *mut c_void, start: *mut c_void) {
    let Some(rt) = runtime() else {
        return;
    };
    if let Err(err) = rt.unregister_stack(pool_from_handle(pool), start as usize) {
        eprintln!("poolguard: unregister_stack failed: {err}");
    }
}
