#![no_main]
use libfuzzer_sys::fuzz_target;
use poolguard_membrane::splay::RangeMap;

// Drive insert/remove/find against a sorted-vector model.
fuzz_target!(|data: &[u8]| {
    let mut map = RangeMap::new();
    let mut model: Vec<(usize, usize)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let start = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let len = usize::from(chunk[3]) + 1;
        match chunk[0] % 3 {
            0 => {
                let end = start + len;
                let covered = model.iter().any(|&(s, e)| s <= start && start < e);
                let overlaps = model.iter().any(|&(s, e)| start < e && s < end);
                if covered {
                    assert!(!map.insert(start, end, ()));
                } else if !overlaps {
                    assert!(map.insert(start, end, ()));
                    model.push((start, end));
                }
            }
            1 => {
                let expected = model.iter().position(|&(s, _)| s == start);
                let removed = map.remove(start);
                assert_eq!(removed.is_some(), expected.is_some());
                if let Some(i) = expected {
                    model.swap_remove(i);
                }
            }
            _ => {
                let expected = model.iter().copied().find(|&(s, e)| s <= start && start < e);
                assert_eq!(map.find(start).map(|(s, e, _)| (s, e)), expected);
            }
        }
    }
});
