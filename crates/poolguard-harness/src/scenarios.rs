//! End-to-end scenarios run against a fresh runtime each.
//!
//! Every scenario returns a [`ScenarioReport`] instead of panicking so the
//! CLI can log all results and gate on the summary.

use std::time::Instant;

use poolguard_membrane::{
    CheckOutcome, CheckSite, FreeOutcome, LogDestination, Runtime, RuntimeConfig, ViolationKind,
};
use serde::Serialize;
use serde_json::json;

use crate::HarnessError;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub passed: bool,
    /// Violation kind the scenario observed, if any.
    pub violation: Option<ViolationKind>,
    pub duration_us: u64,
    pub details: serde_json::Value,
}

type ScenarioFn = fn(&Runtime) -> Result<Observation, HarnessError>;

struct Observation {
    passed: bool,
    violation: Option<ViolationKind>,
    details: serde_json::Value,
}

impl Observation {
    fn new(passed: bool, details: serde_json::Value) -> Self {
        Self {
            passed,
            violation: None,
            details,
        }
    }

    fn with_violation(mut self, kind: Option<ViolationKind>) -> Self {
        self.violation = kind;
        self
    }
}

struct Scenario {
    name: &'static str,
    config: fn() -> RuntimeConfig,
    run: ScenarioFn,
}

fn base_config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_log(LogDestination::Memory)
        .with_token_region(1 << 20)
}

fn dangling_config() -> RuntimeConfig {
    base_config().with_dangling(true)
}

fn rewrite_config() -> RuntimeConfig {
    base_config().with_rewrite_oob(true)
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "a_slab_reuse",
        config: base_config,
        run: slab_reuse,
    },
    Scenario {
        name: "b_overrun_deref",
        config: base_config,
        run: overrun_deref,
    },
    Scenario {
        name: "c_dangling_after_unregister",
        config: dangling_config,
        run: dangling_after_unregister,
    },
    Scenario {
        name: "d_rewrite_to_token",
        config: rewrite_config,
        run: rewrite_to_token,
    },
    Scenario {
        name: "double_free",
        config: dangling_config,
        run: double_free,
    },
    Scenario {
        name: "token_reindex",
        config: rewrite_config,
        run: token_reindex,
    },
];

/// Names of every scenario, in run order.
#[must_use]
pub fn scenario_names() -> Vec<&'static str> {
    SCENARIOS.iter().map(|s| s.name).collect()
}

/// Run every scenario on its own runtime.
pub fn run_all() -> Result<Vec<ScenarioReport>, HarnessError> {
    SCENARIOS.iter().map(run_one).collect()
}

fn run_one(scenario: &Scenario) -> Result<ScenarioReport, HarnessError> {
    let runtime = Runtime::new((scenario.config)())?;
    let start = Instant::now();
    let observation = (scenario.run)(&runtime)?;
    Ok(ScenarioReport {
        name: scenario.name,
        passed: observation.passed,
        violation: observation.violation,
        duration_us: u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
        details: observation.details,
    })
}

/// A freed cell is handed out again without growing the pool.
fn slab_reuse(rt: &Runtime) -> Result<Observation, HarnessError> {
    let pool = rt.create_pool(16)?;
    let p1 = rt.alloc(pool, 20)?;
    let p2 = rt.alloc(pool, 8)?;
    let before = rt.pool_stats(pool)?;
    let freed = rt.free(pool, p1)?;
    let p3 = rt.alloc(pool, 8)?;
    let after = rt.pool_stats(pool)?;
    let passed = matches!(freed, FreeOutcome::Freed { .. })
        && p3 != p2
        && after.slabs_created == before.slabs_created;
    Ok(Observation::new(
        passed,
        json!({
            "p1": p1, "p2": p2, "p3": p3,
            "slabs_created": after.slabs_created,
        }),
    ))
}

/// A 4-byte read 36 bytes past a 64-byte object is attributed to it.
fn overrun_deref(rt: &Runtime) -> Result<Observation, HarnessError> {
    let pool = rt.create_pool(16)?;
    let buf = vec![0u8; 64];
    let p = buf.as_ptr() as usize;
    rt.register(Some(pool), p, 64)?;
    let out = rt.check_deref(Some(pool), p + 100, 4, &CheckSite::new())?;
    let violation = out.violation().cloned();
    let passed = violation.as_ref().is_some_and(|v| {
        v.kind == ViolationKind::OutOfBounds
            && v.object_start == Some(p)
            && v.object_len == Some(64)
    });
    Ok(Observation::new(passed, json!({ "object": p, "reports": rt.violation_count() }))
        .with_violation(violation.map(|v| v.kind)))
}

fn dangling_after_unregister(rt: &Runtime) -> Result<Observation, HarnessError> {
    let pool = rt.create_pool(16)?;
    let buf = vec![0u8; 64];
    let p = buf.as_ptr() as usize;
    rt.register(Some(pool), p, 64)?;
    rt.unregister(Some(pool), p)?;
    let out = rt.check_deref(Some(pool), p, 4, &CheckSite::new())?;
    let kind = out.violation().map(|v| v.kind);
    Ok(Observation::new(
        kind == Some(ViolationKind::DanglingAccess),
        json!({ "object": p }),
    )
    .with_violation(kind))
}

fn rewrite_to_token(rt: &Runtime) -> Result<Observation, HarnessError> {
    let pool = rt.create_pool(16)?;
    let buf = vec![0u8; 64];
    let p = buf.as_ptr() as usize;
    rt.register(Some(pool), p, 64)?;
    let out = rt.check_deref(Some(pool), p + 100, 4, &CheckSite::new())?;
    let passed = match out {
        CheckOutcome::Rewritten { token, pointer } => {
            !(p..p + 64).contains(&token)
                && pointer == p + 100
                && rt.get_actual_value(token) == p + 100
                && rt.violation_count() == 0
        }
        _ => false,
    };
    Ok(Observation::new(
        passed,
        json!({ "object": p, "returned": out.pointer(), "rewrites": rt.metrics().rewrites }),
    ))
}

fn double_free(rt: &Runtime) -> Result<Observation, HarnessError> {
    let pool = rt.create_pool(16)?;
    let p = rt.alloc(pool, 48)?;
    let first = rt.free(pool, p)?;
    let second = rt.free(pool, p)?;
    let kind = match &second {
        FreeOutcome::Rejected(v) => Some(v.kind),
        _ => None,
    };
    Ok(Observation::new(
        matches!(first, FreeOutcome::Freed { .. }) && kind == Some(ViolationKind::DoubleFree),
        json!({ "object": p }),
    )
    .with_violation(kind))
}

/// A token brought back into its object becomes the real pointer again.
fn token_reindex(rt: &Runtime) -> Result<Observation, HarnessError> {
    let pool = rt.create_pool(16)?;
    let buf = vec![0u8; 64];
    let p = buf.as_ptr() as usize;
    rt.register(Some(pool), p, 64)?;
    let site = CheckSite::new();
    let token = rt.check_bounds(Some(pool), p, p + 100, &site)?.pointer();
    let back = rt.check_bounds(Some(pool), token, token.wrapping_sub(90), &site)?;
    Ok(Observation::new(
        token != p + 100 && back == CheckOutcome::Pass(p + 10),
        json!({ "object": p, "token": token, "back": back.pointer() }),
    ))
}
