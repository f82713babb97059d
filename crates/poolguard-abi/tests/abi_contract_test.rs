//! Integration tests for the C entry points.
//!
//! All tests share one process-wide runtime, created once with dangling
//! detection and pointer rewriting on and a JSONL violation log in the
//! temp directory.

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::PathBuf;
use std::ptr;
use std::sync::Once;

use poolguard_abi::check_abi::{
    poolguard_bounds_check, poolguard_bounds_check_ui, poolguard_check_align,
    poolguard_check_deref, poolguard_exact_check, poolguard_exact_check_deref,
    poolguard_funccheck, poolguard_funccheck_ui, poolguard_get_actual_value,
};
use poolguard_abi::pool_abi::{
    PoolguardFrameMark, poolguard_argv_register, poolguard_flush_log, poolguard_init_logfile,
    poolguard_init_runtime, poolguard_pool_alloc, poolguard_pool_calloc, poolguard_pool_destroy,
    poolguard_pool_free, poolguard_pool_init, poolguard_pool_realloc, poolguard_pool_strdup,
    poolguard_register, poolguard_reregister, poolguard_src_pool_free, poolguard_stack_alloc,
    poolguard_stack_mark, poolguard_stack_release, poolguard_unregister,
    poolguard_violation_count,
};
use serde_json::Value;

static INIT: Once = Once::new();

fn log_path() -> PathBuf {
    std::env::temp_dir().join(format!("poolguard-abi-contract-{}.jsonl", std::process::id()))
}

fn init() {
    INIT.call_once(|| {
        let path = CString::new(log_path().to_string_lossy().into_owned()).expect("path");
        // SAFETY: path is a valid C string.
        assert_eq!(unsafe { poolguard_init_logfile(path.as_ptr()) }, 0);
        // SAFETY: no pointers involved.
        assert_eq!(unsafe { poolguard_init_runtime(1, 1, 0) }, 0);
    });
}

fn logged_violations() -> Vec<Value> {
    // SAFETY: no pointers involved.
    unsafe { poolguard_flush_log() };
    std::fs::read_to_string(log_path())
        .expect("violation log")
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl line"))
        .collect()
}

#[test]
fn runtime_cannot_be_initialized_twice() {
    init();
    // SAFETY: no pointers involved.
    assert_eq!(unsafe { poolguard_init_runtime(0, 0, 0) }, -1);
    let path = CString::new("stderr").expect("path");
    // SAFETY: path is a valid C string.
    assert_eq!(unsafe { poolguard_init_logfile(path.as_ptr()) }, -1);
}

#[test]
fn rewriting_runtime_accepts_one_past_the_end() {
    init();
    let buf = vec![0u8; 64];
    let base = buf.as_ptr() as *mut c_void;
    let at = |off: usize| base.cast::<u8>().wrapping_add(off).cast::<c_void>();
    // SAFETY: base points at a live 64-byte buffer; checked pointers are never
    // dereferenced.
    unsafe {
        poolguard_register(ptr::null_mut(), base, 64);
        assert_eq!(poolguard_bounds_check(ptr::null_mut(), base, at(64)), at(64));
        assert_ne!(poolguard_bounds_check(ptr::null_mut(), base, at(65)), at(65));
        assert_eq!(poolguard_exact_check(base, at(64), 64), at(64));
        poolguard_unregister(ptr::null_mut(), base);
    }
}

#[test]
fn pool_allocations_round_trip_through_tokens() {
    init();
    // SAFETY: handles and pointers come from the runtime itself.
    unsafe {
        let pool = poolguard_pool_init(16);
        assert!(!pool.is_null());
        let p = poolguard_pool_alloc(pool, 32).cast::<u8>();
        assert!(!p.is_null());

        let inside = p.wrapping_add(8).cast::<c_void>();
        assert_eq!(poolguard_bounds_check(pool, p.cast(), inside), inside);

        let outside = p.wrapping_add(100).cast::<c_void>();
        let token = poolguard_bounds_check(pool, p.cast(), outside);
        assert_ne!(token, outside, "out-of-bounds result must be rewritten");
        assert_eq!(poolguard_get_actual_value(pool, token), outside);

        let back = poolguard_bounds_check(pool, token, token.cast::<u8>().wrapping_sub(90).cast());
        assert_eq!(back, p.wrapping_add(10).cast());

        poolguard_pool_free(pool, p.cast());
        poolguard_pool_destroy(pool);
        assert_eq!(poolguard_get_actual_value(pool, token), token);
    }
}

#[test]
fn calloc_zeroes_and_realloc_preserves_contents() {
    init();
    // SAFETY: handles and pointers come from the runtime itself; accesses stay
    // inside the allocations.
    unsafe {
        let pool = poolguard_pool_init(8);
        let p = poolguard_pool_calloc(pool, 4, 8).cast::<u8>();
        assert!(!p.is_null());
        assert!((0..32).all(|i| *p.add(i) == 0));
        for i in 0..32 {
            *p.add(i) = i as u8;
        }
        let q = poolguard_pool_realloc(pool, p.cast(), 96).cast::<u8>();
        assert!(!q.is_null());
        assert!((0..32).all(|i| *q.add(i) == i as u8));
        poolguard_pool_free(pool, q.cast());
        poolguard_pool_destroy(pool);
    }
}

#[test]
fn double_free_is_logged_with_source_location() {
    init();
    let file = CString::new("contract.c").expect("file");
    let before = unsafe { poolguard_violation_count() };
    // SAFETY: handles and pointers come from the runtime itself.
    let p = unsafe {
        let pool = poolguard_pool_init(16);
        let p = poolguard_pool_alloc(pool, 48);
        poolguard_pool_free(pool, p);
        poolguard_src_pool_free(pool, p, file.as_ptr(), 42);
        p as usize
    };
    assert!(unsafe { poolguard_violation_count() } > before);

    let logged = logged_violations();
    let entry = logged
        .iter()
        .find(|v| v["kind"] == "DoubleFree" && v["fault_addr"] == p)
        .unwrap_or_else(|| panic!("no DoubleFree for {p:#x} in {logged:?}"));
    assert_eq!(entry["cwe"], 415);
    assert_eq!(entry["source"]["file"], "contract.c");
    assert_eq!(entry["source"]["line"], 42);
}

#[cfg(target_os = "linux")]
#[test]
fn stale_reads_fault_and_resume() {
    init();
    let before = unsafe { poolguard_violation_count() };
    // SAFETY: handles and pointers come from the runtime itself; the write
    // stays inside the live allocation.
    let p = unsafe {
        let pool = poolguard_pool_init(32);
        let p = poolguard_pool_alloc(pool, 32).cast::<u32>();
        assert!(!p.is_null());
        p.write_volatile(11);
        poolguard_pool_free(pool, p.cast());
        p
    };
    // SAFETY: p now lies in a protected shadow page. The fault handler
    // reports the access and unprotects the page, so the read completes.
    let _ = unsafe { p.read_volatile() };
    assert!(unsafe { poolguard_violation_count() } > before);
    let logged = logged_violations();
    assert!(
        logged
            .iter()
            .any(|v| v["kind"] == "DanglingAccess" && v["fault_addr"] == p as usize),
        "{logged:?}"
    );
}

#[test]
fn stack_frames_are_popped_through_saved_marks() {
    init();
    // SAFETY: handles and pointers come from the runtime itself; checked
    // pointers are never dereferenced.
    unsafe {
        let pool = poolguard_pool_init(16);
        let outer = poolguard_stack_alloc(pool, 16).cast::<u8>();
        let mut mark = PoolguardFrameMark::default();
        assert_eq!(poolguard_stack_mark(pool, &mut mark), 0);
        assert_eq!(poolguard_stack_mark(pool, ptr::null_mut()), -1);
        let inner = poolguard_stack_alloc(pool, 32).cast::<u8>();
        let end = inner.wrapping_add(31).cast::<c_void>();
        assert_eq!(poolguard_bounds_check(pool, inner.cast(), end), end);

        poolguard_stack_release(pool, mark);
        let again = poolguard_stack_alloc(pool, 32).cast::<u8>();
        assert_eq!(again, inner, "the popped frame is reused");
        let end = outer.wrapping_add(8).cast::<c_void>();
        assert_eq!(poolguard_bounds_check(pool, outer.cast(), end), end);
        poolguard_pool_destroy(pool);
    }
}

#[test]
fn external_objects_use_the_null_pool_handle() {
    init();
    let buf = vec![0u8; 64];
    let base = buf.as_ptr() as *mut c_void;
    // SAFETY: base points at a live 64-byte buffer; checked pointers are never
    // dereferenced.
    unsafe {
        poolguard_register(ptr::null_mut(), base, 64);
        let end = base.cast::<u8>().wrapping_add(63).cast::<c_void>();
        assert_eq!(poolguard_check_deref(ptr::null_mut(), end, 1), end);

        let past = base.cast::<u8>().wrapping_add(70).cast::<c_void>();
        let token = poolguard_check_deref(ptr::null_mut(), past, 4);
        assert_eq!(poolguard_get_actual_value(ptr::null_mut(), token), past);

        poolguard_unregister(ptr::null_mut(), base);
        let stale = poolguard_check_deref(ptr::null_mut(), base, 4);
        assert_eq!(stale, base, "reported accesses return the pointer unchanged");
    }
    let logged = logged_violations();
    assert!(
        logged
            .iter()
            .any(|v| v["kind"] == "DanglingAccess" && v["fault_addr"] == base as usize),
        "{logged:?}"
    );
}

#[test]
fn argv_strings_and_duplicates_are_registered() {
    init();
    let args = [
        CString::new("prog").expect("arg"),
        CString::new("--flag").expect("arg"),
    ];
    let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr().cast_mut()).collect();
    argv.push(ptr::null_mut());
    // SAFETY: argv is a null-terminated array of live C strings; checked
    // pointers stay inside their objects and the copy is read as a C string.
    unsafe {
        assert_eq!(poolguard_argv_register(2, argv.as_mut_ptr()), argv.as_mut_ptr());
        let nul = argv[1].wrapping_add(6).cast::<c_void>();
        assert_eq!(poolguard_check_deref(ptr::null_mut(), nul, 1), nul);
        let terminator = argv.as_mut_ptr().wrapping_add(2).cast::<c_void>();
        let slot = size_of::<*mut c_char>();
        assert_eq!(poolguard_check_deref(ptr::null_mut(), terminator, slot), terminator);

        let pool = poolguard_pool_init(8);
        let copy = poolguard_pool_strdup(pool, args[1].as_ptr());
        assert!(!copy.is_null());
        assert_eq!(CStr::from_ptr(copy), args[1].as_c_str());
        let end = copy.wrapping_add(6).cast::<c_void>();
        assert_eq!(poolguard_bounds_check(pool, copy.cast(), end), end);
        assert!(poolguard_pool_strdup(pool, ptr::null()).is_null());
        poolguard_pool_free(pool, copy.cast());
        poolguard_pool_destroy(pool);
    }
}

#[test]
fn reregistered_objects_move_with_foreign_reallocs() {
    init();
    let old = vec![0u8; 16];
    let new = vec![0u8; 48];
    let (old, new) = (old.as_ptr() as *mut c_void, new.as_ptr() as *mut c_void);
    let at = |base: *mut c_void, off: usize| base.cast::<u8>().wrapping_add(off).cast::<c_void>();
    // SAFETY: both buffers stay alive; checked pointers are never dereferenced.
    unsafe {
        poolguard_reregister(ptr::null_mut(), old, ptr::null_mut(), 16);
        assert_eq!(poolguard_check_deref(ptr::null_mut(), at(old, 15), 1), at(old, 15));
        poolguard_reregister(ptr::null_mut(), new, old, 48);
        assert_eq!(poolguard_check_deref(ptr::null_mut(), at(new, 47), 1), at(new, 47));
        poolguard_reregister(ptr::null_mut(), ptr::null_mut(), new, 0);
    }
}

#[test]
fn call_targets_and_element_alignment_are_checked() {
    init();
    let targets = [0x4000usize as *const c_void, 0x4100 as *const c_void, ptr::null()];
    // SAFETY: the target list is null-terminated; checked pointers are never
    // dereferenced.
    unsafe {
        let ok = 0x4100usize as *mut c_void;
        assert_eq!(poolguard_funccheck(ok, targets.as_ptr()), ok);
        let bad = 0x4200usize as *mut c_void;
        assert_eq!(poolguard_funccheck(bad, targets.as_ptr()), bad);
        assert_eq!(poolguard_funccheck_ui(bad, targets.as_ptr()), bad);

        let pool = poolguard_pool_init(16);
        let p = poolguard_pool_alloc(pool, 64).cast::<u8>();
        let element = p.wrapping_add(32).cast::<c_void>();
        assert_eq!(poolguard_check_align(pool, element, 0), element);
        let field = p.wrapping_add(36).cast::<c_void>();
        assert_eq!(poolguard_check_align(pool, field, 4), field);
        assert_eq!(poolguard_check_align(pool, field, 0), field);
        poolguard_pool_destroy(pool);
    }
    let logged = logged_violations();
    assert!(
        logged
            .iter()
            .any(|v| v["kind"] == "InvalidCallTarget" && v["fault_addr"] == 0x4200),
        "{logged:?}"
    );
    assert!(logged.iter().any(|v| v["kind"] == "Misaligned"), "{logged:?}");
}

#[test]
fn exact_checks_and_incomplete_sites() {
    init();
    let buf = [0u8; 16];
    let base = buf.as_ptr() as *mut c_void;
    let at = |off: usize| base.cast::<u8>().wrapping_add(off).cast::<c_void>();
    // SAFETY: no checked pointer is dereferenced.
    unsafe {
        assert_eq!(poolguard_exact_check(base, at(15), 16), at(15));
        assert_ne!(poolguard_exact_check(base, at(40), 16), at(40));
        assert_eq!(poolguard_exact_check_deref(base, at(12), 16, 4), at(12));

        let pool = poolguard_pool_init(16);
        let unknown = 0x5000_0000usize as *mut c_void;
        let next = 0x5000_0008usize as *mut c_void;
        assert_eq!(poolguard_bounds_check_ui(pool, unknown, next), next);
        poolguard_pool_destroy(pool);
    }
}
