//! Seeded allocation churn with overlap and bounds verification.

use std::collections::BTreeMap;

use poolguard_membrane::{
    CheckSite, FreeOutcome, LogDestination, MetricsSnapshot, Runtime, RuntimeConfig,
};
use serde::Serialize;

use crate::HarnessError;

#[derive(Debug, Clone, Copy)]
pub struct StressConfig {
    pub seed: u64,
    pub steps: usize,
    pub node_size: usize,
    /// Largest request, in bytes.
    pub max_request: usize,
    pub dangling: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            steps: 10_000,
            node_size: 16,
            max_request: 256,
            dangling: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub seed: u64,
    pub steps: usize,
    pub allocations: u64,
    pub frees: u64,
    pub checks: u64,
    pub peak_live: usize,
    pub violations: u64,
    pub metrics: MetricsSnapshot,
}

/// xorshift64* generator; a zero seed is remapped so the stream never sticks.
#[derive(Debug, Clone, Copy)]
struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n.max(1) as u64) as usize
    }
}

/// Run `config.steps` random operations against one pool.
///
/// Every allocation must be disjoint from every live object, every in-bounds
/// access must pass and every one-past-end pointer must be rejected. The
/// first broken expectation ends the run with [`HarnessError::Invariant`].
pub fn run_stress(config: &StressConfig) -> Result<StressReport, HarnessError> {
    let rt = Runtime::new(
        RuntimeConfig::new()
            .with_dangling(config.dangling)
            .with_log(LogDestination::Off),
    )?;
    let pool = rt.create_pool(config.node_size)?;
    let mut rng = XorShift64::new(config.seed);
    // start -> len
    let mut live: BTreeMap<usize, usize> = BTreeMap::new();
    let site = CheckSite::new();
    let mut report = StressReport {
        seed: config.seed,
        steps: config.steps,
        allocations: 0,
        frees: 0,
        checks: 0,
        peak_live: 0,
        violations: 0,
        metrics: MetricsSnapshot::default(),
    };
    let mut expected_violations = 0_u64;

    for step in 0..config.steps {
        let roll = rng.below(10);
        if live.is_empty() || roll < 4 {
            let len = 1 + rng.below(config.max_request);
            let addr = rt.alloc(pool, len)?;
            let before = live.range(..addr).next_back();
            let after = live.range(addr..).next();
            let overlaps = before.is_some_and(|(&s, &n)| s + n > addr)
                || after.is_some_and(|(&s, _)| s < addr + len);
            if overlaps {
                return Err(HarnessError::Invariant(format!(
                    "step {step}: {addr:#x}+{len} overlaps a live object"
                )));
            }
            live.insert(addr, len);
            report.allocations += 1;
            report.peak_live = report.peak_live.max(live.len());
            continue;
        }

        let pick = rng.below(live.len());
        let Some((&addr, &len)) = live.iter().nth(pick) else {
            continue;
        };
        if roll < 8 {
            let off = rng.below(len);
            report.checks += 2;
            if !rt.check_deref(Some(pool), addr + off, 1, &site)?.is_pass()
                || !rt.check_bounds(Some(pool), addr, addr + off, &site)?.is_pass()
            {
                return Err(HarnessError::Invariant(format!(
                    "step {step}: in-bounds access {addr:#x}+{off} rejected"
                )));
            }
        } else if roll == 8 {
            report.checks += 1;
            expected_violations += 1;
            if rt.check_bounds(Some(pool), addr, addr + len, &site)?.is_pass() {
                return Err(HarnessError::Invariant(format!(
                    "step {step}: one-past-end of {addr:#x}+{len} accepted"
                )));
            }
        } else {
            if !matches!(rt.free(pool, addr)?, FreeOutcome::Freed { .. }) {
                return Err(HarnessError::Invariant(format!(
                    "step {step}: free of live {addr:#x} rejected"
                )));
            }
            live.remove(&addr);
            report.frees += 1;
        }
    }

    report.violations = rt.violation_count();
    report.metrics = rt.metrics();
    if report.violations != expected_violations {
        return Err(HarnessError::Invariant(format!(
            "expected {expected_violations} violations, runtime reported {}",
            report.violations
        )));
    }
    Ok(report)
}
