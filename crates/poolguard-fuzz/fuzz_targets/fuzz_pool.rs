#![no_main]
use libfuzzer_sys::fuzz_target;
use poolguard_membrane::{CheckSite, LogDestination, Runtime, RuntimeConfig};

// Each 4-byte chunk is one operation: opcode, then a 16-bit size or index,
// then an offset byte.
fuzz_target!(|data: &[u8]| {
    let Some((&flags, ops)) = data.split_first() else {
        return;
    };
    let Ok(rt) = Runtime::new(
        RuntimeConfig::new()
            .with_dangling(flags & 1 != 0)
            .with_rewrite_oob(flags & 2 != 0)
            .with_log(LogDestination::Off)
            .with_token_region(1 << 16),
    ) else {
        return;
    };
    let node = [8usize, 16, 24, 48][usize::from(flags >> 2) & 3];
    let Ok(pool) = rt.create_pool(node) else {
        return;
    };
    let site = CheckSite::new();
    let mut live: Vec<(usize, usize)> = Vec::new();

    for chunk in ops.chunks_exact(4) {
        let arg = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let off = usize::from(chunk[3]);
        match chunk[0] % 6 {
            0 => {
                let len = arg.clamp(1, 16 * 1024);
                if let Ok(addr) = rt.alloc(pool, len) {
                    assert!(
                        live.iter().all(|&(s, n)| addr + len <= s || s + n <= addr),
                        "allocation overlaps a live object"
                    );
                    live.push((addr, len));
                }
            }
            1 if !live.is_empty() => {
                let (addr, _) = live.swap_remove(arg % live.len());
                let _ = rt.free(pool, addr);
            }
            2 if !live.is_empty() => {
                let (addr, len) = live[arg % live.len()];
                let inside = addr + off % len;
                let out = rt.check_deref(Some(pool), inside, 1, &site);
                assert!(out.is_ok_and(|o| o.is_pass()), "in-bounds access rejected");
            }
            3 if !live.is_empty() => {
                let (addr, len) = live[arg % live.len()];
                if let Ok(out) = rt.check_bounds(Some(pool), addr, addr + len + off, &site) {
                    let back = rt.get_actual_value(out.pointer());
                    assert_eq!(back, addr + len + off);
                }
            }
            4 => {
                // Arbitrary addresses: the runtime must classify, never crash.
                let addr = arg << 12 | off;
                let _ = rt.check_deref(Some(pool), addr, 4, &site);
                if live.iter().all(|&(s, _)| s != addr) {
                    let _ = rt.free(pool, addr);
                }
            }
            _ => {
                let _ = rt.realloc(pool, 0, arg.max(1));
            }
        }
    }
    let _ = rt.destroy_pool(pool);
});
