//! Bounds and dereference checks.
//!
//! Exact checks compare against a size known at the call site and never touch
//! a registry. Registry checks find the object behind the base pointer, then
//! accept the result, rewrite it into an out-of-bounds token, or report a
//! violation according to the runtime configuration.

use crate::config::IndexingMode;
use crate::log::{Event, LogLevel};
use crate::metrics::RuntimeMetrics;
use crate::oob::OobRecord;
use crate::registry::{ObjectClass, ObjectSpan, SourceLoc};
use crate::report::{Violation, ViolationKind};
use crate::runtime::{PoolId, Runtime, RuntimeError};

/// Where a check was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSite {
    pub pc: usize,
    pub source: Option<SourceLoc>,
    /// Cleared when the analysis could not see every use of the pointer;
    /// unknown pointers are then accepted instead of reported.
    pub complete: bool,
}

impl CheckSite {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pc: 0,
            source: None,
            complete: true,
        }
    }

    #[must_use]
    pub fn incomplete() -> Self {
        Self {
            complete: false,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn with_pc(mut self, pc: usize) -> Self {
        self.pc = pc;
        self
    }

    #[must_use]
    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source = Some(SourceLoc::new(file, line));
        self
    }
}

impl Default for CheckSite {
    fn default() -> Self {
        Self::new()
    }
}

/// What a signal handler does after [`Runtime::handle_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The fault was a stale shadow access; retrying it now succeeds.
    Resume,
    /// Hand the fault to the previously installed handler.
    Escalate,
}

/// Verdict of a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Use this pointer. For token re-entry it is the real pointer.
    Pass(usize),
    /// The result was out of bounds and has been replaced by a token.
    Rewritten { token: usize, pointer: usize },
    /// A violation was reported; the original pointer is handed back.
    Rejected {
        pointer: usize,
        violation: Box<Violation>,
    },
}

impl CheckOutcome {
    /// The value the instrumented program continues with.
    #[must_use]
    pub fn pointer(&self) -> usize {
        match self {
            Self::Pass(p) => *p,
            Self::Rewritten { token, .. } => *token,
            Self::Rejected { pointer, .. } => *pointer,
        }
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    #[must_use]
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Rejected { violation, .. } => Some(violation),
            _ => None,
        }
    }
}

/// Is `result` an acceptable arithmetic result inside `span`?
fn within(span: ObjectSpan, result: usize, indexing: IndexingMode) -> bool {
    match indexing {
        IndexingMode::Strict => span.contains(result),
        IndexingMode::Lenient => span.start <= result && result <= span.end,
    }
}

/// Does `[ptr, ptr+len)` lie inside `span`?
fn covers(span: ObjectSpan, ptr: usize, len: usize) -> bool {
    span.start <= ptr && ptr.checked_add(len.max(1)).is_some_and(|end| end <= span.end)
}

/// What a failed check is measured against.
struct Failure<'a> {
    kind: ViolationKind,
    fault: usize,
    object: Option<(ObjectSpan, Option<ObjectClass>)>,
    pool: Option<PoolId>,
    site: &'a CheckSite,
    rewritable: bool,
}

impl Runtime {
    /// Fast path for a statically sized object at `base`.
    pub fn exact_check(
        &self,
        base: usize,
        result: usize,
        size: usize,
        site: &CheckSite,
    ) -> CheckOutcome {
        if !self.config.mode.checks_enabled() {
            return CheckOutcome::Pass(result);
        }
        RuntimeMetrics::inc(&self.metrics.fast_checks);
        let span = ObjectSpan::new(base, size);
        if base == 0 || within(span, result, self.config.indexing) {
            return CheckOutcome::Pass(result);
        }
        self.fail(
            "exact_check",
            Failure {
                kind: ViolationKind::OutOfBounds,
                fault: result,
                object: Some((span, None)),
                pool: None,
                site,
                rewritable: true,
            },
        )
    }

    /// Fast path for a `len`-byte access at `result` into a statically sized
    /// object at `base`.
    pub fn exact_check_deref(
        &self,
        base: usize,
        result: usize,
        size: usize,
        len: usize,
        site: &CheckSite,
    ) -> CheckOutcome {
        if !self.config.mode.checks_enabled() {
            return CheckOutcome::Pass(result);
        }
        RuntimeMetrics::inc(&self.metrics.fast_checks);
        let span = ObjectSpan::new(base, size);
        if base == 0 || covers(span, result, len) {
            return CheckOutcome::Pass(result);
        }
        self.fail(
            "exact_check_deref",
            Failure {
                kind: ViolationKind::OutOfBounds,
                fault: result,
                object: Some((span, None)),
                pool: None,
                site,
                rewritable: false,
            },
        )
    }

    /// Check pointer arithmetic `result = base + offset` against the object
    /// `base` points into.
    pub fn check_bounds(
        &self,
        pool: Option<PoolId>,
        base: usize,
        result: usize,
        site: &CheckSite,
    ) -> Result<CheckOutcome, RuntimeError> {
        if !self.config.mode.checks_enabled() || base == 0 {
            return Ok(CheckOutcome::Pass(result));
        }
        let indexing = self.config.indexing;

        if let Some(rec) = self.decode_token(base) {
            let real = rec.pointer.wrapping_add(result.wrapping_sub(base));
            if within(rec.object, real, indexing) {
                RuntimeMetrics::inc(&self.metrics.token_reentries);
                self.event(
                    Event::new(LogLevel::Debug, "check_bounds", "reentry", "pass")
                        .pool(rec.pool.map(PoolId::raw))
                        .ptr(real),
                    || format!("token={base:#x}"),
                );
                return Ok(CheckOutcome::Pass(real));
            }
            return Ok(self.fail(
                "check_bounds",
                Failure {
                    kind: ViolationKind::OutOfBounds,
                    fault: real,
                    object: Some((rec.object, None)),
                    pool: rec.pool,
                    site,
                    rewritable: true,
                },
            ));
        }

        if let Some((obj, owner)) = self.lookup(pool, base)? {
            if within(obj.span, result, indexing) {
                return Ok(CheckOutcome::Pass(result));
            }
            return Ok(self.fail(
                "check_bounds",
                Failure {
                    kind: ViolationKind::OutOfBounds,
                    fault: result,
                    object: Some((obj.span, Some(obj.class))),
                    pool: owner,
                    site,
                    rewritable: true,
                },
            ));
        }

        Ok(self.unknown_pointer("check_bounds", pool, base, result, site))
    }

    /// Check a `len`-byte access at `ptr`.
    pub fn check_deref(
        &self,
        pool: Option<PoolId>,
        ptr: usize,
        len: usize,
        site: &CheckSite,
    ) -> Result<CheckOutcome, RuntimeError> {
        if !self.config.mode.checks_enabled() {
            return Ok(CheckOutcome::Pass(ptr));
        }

        // Dereferencing a token is always out of bounds.
        if let Some(rec) = self.decode_token(ptr) {
            return Ok(self.fail(
                "check_deref",
                Failure {
                    kind: ViolationKind::OutOfBounds,
                    fault: ptr,
                    object: Some((rec.object, None)),
                    pool: rec.pool,
                    site,
                    rewritable: false,
                },
            ));
        }

        if let Some((obj, owner)) = self.lookup(pool, ptr)? {
            if covers(obj.span, ptr, len) {
                return Ok(CheckOutcome::Pass(ptr));
            }
            return Ok(self.fail(
                "check_deref",
                Failure {
                    kind: ViolationKind::OutOfBounds,
                    fault: ptr,
                    object: Some((obj.span, Some(obj.class))),
                    pool: owner,
                    site,
                    rewritable: true,
                },
            ));
        }

        let freed = self.detector.lock().freed_at(ptr).is_some();
        if !freed && let Some((obj, owner)) = self.nearest(pool, ptr)? {
            return Ok(self.fail(
                "check_deref",
                Failure {
                    kind: ViolationKind::OutOfBounds,
                    fault: ptr,
                    object: Some((obj.span, Some(obj.class))),
                    pool: owner,
                    site,
                    rewritable: true,
                },
            ));
        }

        Ok(self.unknown_pointer("check_deref", pool, ptr, ptr, site))
    }

    /// Check that `ptr` sits `offset` bytes into an element of `pool`.
    ///
    /// The element is located through the registry and the distance from its
    /// start is taken modulo the pool's node size, so pointers into arrays of
    /// elements are accepted. A null pointer with offset 0 is aligned, and
    /// without a pool there is nothing to check against.
    pub fn check_align(
        &self,
        pool: Option<PoolId>,
        ptr: usize,
        offset: usize,
        site: &CheckSite,
    ) -> Result<CheckOutcome, RuntimeError> {
        let Some(id) = pool else {
            return Ok(CheckOutcome::Pass(ptr));
        };
        if !self.config.mode.checks_enabled() || (ptr == 0 && offset == 0) {
            return Ok(CheckOutcome::Pass(ptr));
        }
        let node_size = self.pool_node_size(id)?;
        let found = self.lookup(pool, ptr)?;
        if let Some((obj, _)) = found
            && (ptr - obj.span.start) % node_size == offset
        {
            return Ok(CheckOutcome::Pass(ptr));
        }
        if found.is_none() && !site.complete {
            return Ok(CheckOutcome::Pass(ptr));
        }
        Ok(self.fail(
            "check_align",
            Failure {
                kind: ViolationKind::Misaligned,
                fault: ptr,
                object: found.map(|(obj, _)| (obj.span, Some(obj.class))),
                pool,
                site,
                rewritable: false,
            },
        ))
    }

    /// Check an indirect call target against the permitted set. At an
    /// incomplete site the set may be missing targets, so every call passes.
    pub fn check_call_target(
        &self,
        target: usize,
        allowed: &[usize],
        site: &CheckSite,
    ) -> CheckOutcome {
        if !self.config.mode.checks_enabled() || !site.complete || allowed.contains(&target) {
            return CheckOutcome::Pass(target);
        }
        self.fail(
            "check_call_target",
            Failure {
                kind: ViolationKind::InvalidCallTarget,
                fault: target,
                object: None,
                pool: None,
                site,
                rewritable: false,
            },
        )
    }

    /// The pointer a token stands for; any other value is returned unchanged.
    #[must_use]
    pub fn get_actual_value(&self, value: usize) -> usize {
        self.tokens.lock().actual_value(value)
    }

    /// Attribute a hardware fault at `addr`.
    #[must_use]
    pub fn classify_fault(&self, addr: usize) -> Violation {
        {
            let detector = self.detector.lock();
            if let Some(rec) = detector.freed_at(addr) {
                return Violation::new(ViolationKind::DanglingAccess, addr)
                    .with_pool(rec.pool)
                    .with_object(rec.span, Some(rec.class))
                    .with_provenance(rec.provenance.clone());
            }
            if detector.is_retired(addr) {
                return Violation::new(ViolationKind::DanglingAccess, addr)
                    .with_detail("protected shadow page");
            }
        }
        if let Some(rec) = self.decode_token(addr) {
            return Violation::new(ViolationKind::OutOfBounds, addr)
                .with_pool(rec.pool.map(PoolId::raw))
                .with_object(rec.object, None)
                .with_source(rec.site)
                .with_detail(format!("token for {:#x}", rec.pointer));
        }
        Violation::new(ViolationKind::UnregisteredAccess, addr)
    }

    /// Classify a fault at `addr`, report it and return the report.
    pub fn report_fault(&self, addr: usize, pc: usize) -> Violation {
        let violation = self.classify_fault(addr).with_pc(pc);
        self.report(&violation, "fault");
        violation
    }

    /// Report a hardware fault and decide whether the faulting access may be
    /// retried. Accesses through a protected shadow are resumed by exposing
    /// the shadow; every other fault is left to the previous handler.
    pub fn handle_fault(&self, addr: usize, pc: usize) -> FaultResolution {
        let violation = self.report_fault(addr, pc);
        if violation.kind != ViolationKind::DanglingAccess {
            return FaultResolution::Escalate;
        }
        let exposed = self.detector.lock().expose(addr);
        match exposed {
            Ok(true) => {
                RuntimeMetrics::inc(&self.metrics.faults_resumed);
                FaultResolution::Resume
            }
            Ok(false) => FaultResolution::Escalate,
            Err(err) => {
                self.event(
                    Event::new(LogLevel::Error, "fault", "expose", "failed").ptr(addr),
                    || err.to_string(),
                );
                FaultResolution::Escalate
            }
        }
    }

    fn decode_token(&self, value: usize) -> Option<OobRecord> {
        self.tokens.lock().decode(value).cloned()
    }

    /// No live object covers `addr`: dangling, unregistered, or accepted at
    /// an incomplete site.
    fn unknown_pointer(
        &self,
        symbol: &str,
        pool: Option<PoolId>,
        addr: usize,
        result: usize,
        site: &CheckSite,
    ) -> CheckOutcome {
        let freed = self
            .detector
            .lock()
            .freed_at(addr)
            .map(|rec| (rec.span, rec.class, rec.pool, rec.provenance.clone()));
        if let Some((span, class, freed_pool, provenance)) = freed {
            let violation = Violation::new(ViolationKind::DanglingAccess, result)
                .with_pc(site.pc)
                .with_pool(freed_pool)
                .with_object(span, Some(class))
                .with_source(site.source.clone())
                .with_provenance(provenance);
            self.report(&violation, symbol);
            return CheckOutcome::Rejected {
                pointer: result,
                violation: Box::new(violation),
            };
        }
        if !site.complete {
            return CheckOutcome::Pass(result);
        }
        self.fail(
            symbol,
            Failure {
                kind: ViolationKind::UnregisteredAccess,
                fault: result,
                object: None,
                pool,
                site,
                rewritable: false,
            },
        )
    }

    fn fail(&self, symbol: &str, failure: Failure<'_>) -> CheckOutcome {
        let Failure {
            kind,
            fault,
            object,
            pool,
            site,
            rewritable,
        } = failure;

        if rewritable
            && kind == ViolationKind::OutOfBounds
            && self.config.rewrites()
            && let Some((span, _)) = object
        {
            let token = self
                .tokens
                .lock()
                .rewrite(fault, span, pool, site.source.clone());
            match token {
                Some(token) => {
                    RuntimeMetrics::inc(&self.metrics.rewrites);
                    self.event(
                        Event::new(LogLevel::Debug, symbol, "rewrite", "token")
                            .pool(pool.map(PoolId::raw))
                            .ptr(fault),
                        || format!("token={token:#x} object={:#x}+{}", span.start, span.len()),
                    );
                    return CheckOutcome::Rewritten {
                        token,
                        pointer: fault,
                    };
                }
                None => self.event(
                    Event::new(LogLevel::Warn, symbol, "rewrite", "exhausted")
                        .pool(pool.map(PoolId::raw))
                        .ptr(fault),
                    || "token region exhausted; reporting instead".to_string(),
                ),
            }
        }

        let mut violation = Violation::new(kind, fault)
            .with_pc(site.pc)
            .with_pool(pool.map(PoolId::raw))
            .with_source(site.source.clone());
        if let Some((span, class)) = object {
            violation = violation
                .with_object(span, class)
                .with_provenance(self.provenance(pool, span.start));
        }
        self.report(&violation, symbol);
        CheckOutcome::Rejected {
            pointer: fault,
            violation: Box::new(violation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogDestination, RuntimeConfig};

    fn runtime(config: RuntimeConfig) -> Runtime {
        Runtime::new(config.with_log(LogDestination::Memory).with_token_region(1 << 20))
            .expect("runtime")
    }

    #[test]
    fn exact_check_honours_indexing_mode() {
        let strict = runtime(RuntimeConfig::new());
        let site = CheckSite::new();
        assert!(strict.exact_check(0x1000, 0x1000, 16, &site).is_pass());
        assert!(strict.exact_check(0x1000, 0x100F, 16, &site).is_pass());
        assert!(!strict.exact_check(0x1000, 0x1010, 16, &site).is_pass());

        let lenient = runtime(RuntimeConfig::new().with_indexing(IndexingMode::Lenient));
        assert!(lenient.exact_check(0x1000, 0x1010, 16, &site).is_pass());
        assert!(!lenient.exact_check(0x1000, 0x1011, 16, &site).is_pass());
        assert_eq!(lenient.metrics().fast_checks, 2);
    }

    #[test]
    fn exact_deref_needs_whole_access_inside() {
        let rt = runtime(RuntimeConfig::new());
        let site = CheckSite::new();
        assert!(rt.exact_check_deref(0x1000, 0x100C, 16, 4, &site).is_pass());
        let out = rt.exact_check_deref(0x1000, 0x100D, 16, 4, &site);
        assert_eq!(out.violation().unwrap().kind, ViolationKind::OutOfBounds);
        assert_eq!(out.pointer(), 0x100D);
    }

    #[test]
    fn alignment_is_measured_modulo_the_node_size() {
        let rt = runtime(RuntimeConfig::new());
        let pool = rt.create_pool(16).unwrap();
        let p = rt.alloc(pool, 64).unwrap();
        let site = CheckSite::new();
        assert!(rt.check_align(Some(pool), p + 32, 0, &site).unwrap().is_pass());
        assert!(rt.check_align(Some(pool), p + 36, 4, &site).unwrap().is_pass());
        let out = rt.check_align(Some(pool), p + 36, 0, &site).unwrap();
        let v = out.violation().unwrap();
        assert_eq!(v.kind, ViolationKind::Misaligned);
        assert_eq!(v.object_start, Some(p));

        assert!(rt.check_align(Some(pool), 0, 0, &site).unwrap().is_pass());
        assert!(rt.check_align(None, p + 3, 0, &site).unwrap().is_pass());
        let unknown = 0xdead_0000;
        assert!(
            rt.check_align(Some(pool), unknown, 0, &CheckSite::incomplete())
                .unwrap()
                .is_pass()
        );
        assert!(!rt.check_align(Some(pool), unknown, 0, &site).unwrap().is_pass());
        assert_eq!(rt.violation_count(), 2);
    }

    #[test]
    fn call_targets_must_be_listed_at_complete_sites() {
        let rt = runtime(RuntimeConfig::new());
        let targets = [0x4000, 0x4100];
        assert!(rt.check_call_target(0x4100, &targets, &CheckSite::new()).is_pass());
        let out = rt.check_call_target(0x4200, &targets, &CheckSite::new());
        assert_eq!(out.violation().unwrap().kind, ViolationKind::InvalidCallTarget);
        assert_eq!(out.pointer(), 0x4200);
        assert!(rt.check_call_target(0x4200, &targets, &CheckSite::incomplete()).is_pass());
        assert!(rt.check_call_target(0x4200, &[], &CheckSite::incomplete()).is_pass());
        assert_eq!(rt.violation_count(), 1);
    }

    #[test]
    fn exact_checks_skip_null_bases() {
        let rt = runtime(RuntimeConfig::new());
        let site = CheckSite::new();
        assert!(rt.exact_check(0, 0x40, 16, &site).is_pass());
        assert_eq!(
            rt.exact_check_deref(0, 0x40, 16, 4, &site),
            CheckOutcome::Pass(0x40)
        );
        assert_eq!(rt.violation_count(), 0);
    }

    #[test]
    fn incomplete_sites_accept_unknown_pointers() {
        let rt = runtime(RuntimeConfig::new());
        let pool = rt.create_pool(16).unwrap();
        let out = rt
            .check_bounds(Some(pool), 0xdead_0000, 0xdead_0008, &CheckSite::incomplete())
            .unwrap();
        assert_eq!(out, CheckOutcome::Pass(0xdead_0008));
        let out = rt
            .check_bounds(Some(pool), 0xdead_0000, 0xdead_0008, &CheckSite::new())
            .unwrap();
        assert_eq!(out.violation().unwrap().kind, ViolationKind::UnregisteredAccess);
        assert_eq!(out.violation().unwrap().cwe, 822);
    }

    #[test]
    fn null_base_and_off_mode_pass_through() {
        let rt = runtime(RuntimeConfig::new());
        assert_eq!(
            rt.check_bounds(None, 0, 42, &CheckSite::new()).unwrap(),
            CheckOutcome::Pass(42)
        );
        let off = runtime(RuntimeConfig::new().with_mode(crate::config::CheckMode::Off));
        assert_eq!(
            off.check_deref(None, 0x10, 4, &CheckSite::new()).unwrap(),
            CheckOutcome::Pass(0x10)
        );
        assert_eq!(off.violation_count(), 0);
    }

    #[test]
    fn unknown_fault_is_unregistered() {
        let rt = runtime(RuntimeConfig::new());
        let v = rt.report_fault(0x42, 0x400123);
        assert_eq!(v.kind, ViolationKind::UnregisteredAccess);
        assert_eq!(v.fault_pc, 0x400123);
        assert_eq!(rt.violation_count(), 1);
    }
}
