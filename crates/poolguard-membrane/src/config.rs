//! Runtime configuration.
//!
//! Configuration is fixed when a [`crate::Runtime`] is created. It comes from
//! three places:
//! - the builder methods on [`RuntimeConfig`];
//! - [`RuntimeConfig::from_flags`], mirroring the C initialization entry
//!   point (dangling, rewrite, terminate);
//! - [`RuntimeConfig::from_env`], reading the `POOLGUARD_*` variables.
//!
//! The process-wide check mode (`POOLGUARD_MODE`) is resolved once through an
//! atomic state machine so it can be queried from the ABI hot path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::log::LogLevel;
use crate::oob::DEFAULT_TOKEN_REGION;

/// How far past its object a computed pointer may go.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexingMode {
    /// One-past-the-end is an out-of-bounds result.
    #[default]
    Strict,
    /// One-past-the-end is accepted (loop-end sentinels) but never dereferenceable.
    Lenient,
}

impl IndexingMode {
    /// Parse from string (case-insensitive). Unknown values select `Strict`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" | "nonstrict" | "non-strict" | "relaxed" | "0" | "false" | "off" => {
                Self::Lenient
            }
            _ => Self::Strict,
        }
    }
}

/// Process-wide checking mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckMode {
    /// Apply the configured failure policy.
    #[default]
    Enforce,
    /// Log violations but never terminate or rewrite.
    Audit,
    /// Checks pass every pointer through untouched.
    Off,
}

impl CheckMode {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "audit" | "log" | "report" => Self::Audit,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Enforce,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Audit => "audit",
            Self::Off => "off",
        }
    }

    #[must_use]
    pub const fn checks_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Where violation reports go.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum LogDestination {
    #[default]
    Stderr,
    File(PathBuf),
    /// Keep JSONL lines in memory (tests and the harness).
    Memory,
    Off,
}

impl LogDestination {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" | "-" => Self::Stderr,
            "memory" | "mem" => Self::Memory,
            "off" | "none" => Self::Off,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

/// Shadow recycling policy for the dangling-pointer detector.
///
/// A freed object's shadow stays protected until a new object needs a shadow
/// of the same pages and the page run already holds `max_protected` protected
/// shadows; then the oldest protected one is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowPolicy {
    pub max_protected: usize,
}

impl Default for ShadowPolicy {
    fn default() -> Self {
        Self { max_protected: 4 }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub dangling: bool,
    pub rewrite_oob: bool,
    pub terminate: bool,
    pub indexing: IndexingMode,
    pub mode: CheckMode,
    pub log: LogDestination,
    pub log_level: LogLevel,
    pub shadow: ShadowPolicy,
    pub token_region: usize,
    /// Install the SIGSEGV/SIGBUS handler when the C runtime starts.
    pub fault_handler: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dangling: false,
            rewrite_oob: false,
            terminate: false,
            indexing: IndexingMode::Strict,
            mode: CheckMode::Enforce,
            log: LogDestination::Stderr,
            log_level: LogLevel::Info,
            shadow: ShadowPolicy::default(),
            token_region: DEFAULT_TOKEN_REGION,
            fault_handler: true,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror of the C initialization call: strict indexing is on exactly
    /// when rewriting is off.
    #[must_use]
    pub fn from_flags(dangling: bool, rewrite_oob: bool, terminate: bool) -> Self {
        Self::default().with_flags(dangling, rewrite_oob, terminate)
    }

    /// Apply the C initialization flags on top of an existing config.
    #[must_use]
    pub fn with_flags(mut self, dangling: bool, rewrite_oob: bool, terminate: bool) -> Self {
        self.dangling = dangling;
        self.rewrite_oob = rewrite_oob;
        self.terminate = terminate;
        self.indexing = if rewrite_oob {
            IndexingMode::Lenient
        } else {
            IndexingMode::Strict
        };
        self
    }

    /// Read the `POOLGUARD_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = lookup("POOLGUARD_DANGLING") {
            cfg.dangling = parse_flag(&v);
        }
        if let Some(v) = lookup("POOLGUARD_REWRITE_OOB") {
            cfg.rewrite_oob = parse_flag(&v);
            if cfg.rewrite_oob {
                cfg.indexing = IndexingMode::Lenient;
            }
        }
        if let Some(v) = lookup("POOLGUARD_TERMINATE") {
            cfg.terminate = parse_flag(&v);
        }
        if let Some(v) = lookup("POOLGUARD_FAULT_HANDLER") {
            cfg.fault_handler = parse_flag(&v);
        }
        if let Some(v) = lookup("POOLGUARD_INDEXING") {
            cfg.indexing = IndexingMode::from_str_loose(&v);
        }
        if let Some(v) = lookup("POOLGUARD_MODE") {
            cfg.mode = CheckMode::from_str_loose(&v);
        }
        if let Some(v) = lookup("POOLGUARD_LOG") {
            cfg.log = LogDestination::from_str_loose(&v);
        }
        if let Some(v) = lookup("POOLGUARD_LOG_LEVEL") {
            cfg.log_level = LogLevel::from_str_loose(&v);
        }
        if let Some(n) =
            lookup("POOLGUARD_MAX_PROTECTED_SHADOWS").and_then(|v| v.trim().parse().ok())
        {
            cfg.shadow.max_protected = n;
        }
        cfg
    }

    #[must_use]
    pub fn with_fault_handler(mut self, on: bool) -> Self {
        self.fault_handler = on;
        self
    }

    #[must_use]
    pub fn with_dangling(mut self, on: bool) -> Self {
        self.dangling = on;
        self
    }

    #[must_use]
    pub fn with_rewrite_oob(mut self, on: bool) -> Self {
        self.rewrite_oob = on;
        self
    }

    #[must_use]
    pub fn with_terminate(mut self, on: bool) -> Self {
        self.terminate = on;
        self
    }

    #[must_use]
    pub fn with_indexing(mut self, indexing: IndexingMode) -> Self {
        self.indexing = indexing;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: LogDestination) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_shadow_policy(mut self, shadow: ShadowPolicy) -> Self {
        self.shadow = shadow;
        self
    }

    #[must_use]
    pub fn with_token_region(mut self, bytes: usize) -> Self {
        self.token_region = bytes;
        self
    }

    /// Out-of-bounds results become tokens.
    #[must_use]
    pub fn rewrites(&self) -> bool {
        self.rewrite_oob && self.mode == CheckMode::Enforce
    }

    /// A violation aborts the process.
    #[must_use]
    pub fn terminates(&self) -> bool {
        self.terminate && self.mode == CheckMode::Enforce
    }
}

/// Loose boolean parse: `1`, `true`, `on`, `yes`, `enabled` are true.
#[must_use]
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes" | "enabled"
    )
}

// 0=unresolved, 1=Enforce, 2=Audit, 3=Off, 255=resolving.
static CACHED_MODE: AtomicU8 = AtomicU8::new(0);

const MODE_UNRESOLVED: u8 = 0;
const MODE_ENFORCE: u8 = 1;
const MODE_AUDIT: u8 = 2;
const MODE_OFF: u8 = 3;
const MODE_RESOLVING: u8 = 255;

fn mode_to_u8(mode: CheckMode) -> u8 {
    match mode {
        CheckMode::Enforce => MODE_ENFORCE,
        CheckMode::Audit => MODE_AUDIT,
        CheckMode::Off => MODE_OFF,
    }
}

fn u8_to_mode(v: u8) -> CheckMode {
    match v {
        MODE_AUDIT => CheckMode::Audit,
        MODE_OFF => CheckMode::Off,
        _ => CheckMode::Enforce,
    }
}

/// Process-wide check mode from `POOLGUARD_MODE`, resolved once.
///
/// A call that races the first resolution sees `Enforce`.
#[must_use]
pub fn check_mode() -> CheckMode {
    let cached = CACHED_MODE.load(Ordering::Relaxed);
    if cached != MODE_UNRESOLVED && cached != MODE_RESOLVING {
        return u8_to_mode(cached);
    }
    if cached == MODE_RESOLVING
        || CACHED_MODE
            .compare_exchange(
                MODE_UNRESOLVED,
                MODE_RESOLVING,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
    {
        let v = CACHED_MODE.load(Ordering::Relaxed);
        return if v != MODE_UNRESOLVED && v != MODE_RESOLVING {
            u8_to_mode(v)
        } else {
            CheckMode::Enforce
        };
    }
    let mode = std::env::var("POOLGUARD_MODE")
        .map(|v| CheckMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
    mode
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn flags_parse_loosely() {
        for yes in ["1", "true", "TRUE", " on ", "yes", "enabled"] {
            assert!(parse_flag(yes), "{yes}");
        }
        for no in ["0", "false", "off", "", "maybe"] {
            assert!(!parse_flag(no), "{no}");
        }
    }

    #[test]
    fn from_flags_ties_indexing_to_rewrite() {
        let cfg = RuntimeConfig::from_flags(true, true, false);
        assert!(cfg.dangling);
        assert_eq!(cfg.indexing, IndexingMode::Lenient);
        let cfg = RuntimeConfig::from_flags(false, false, true);
        assert_eq!(cfg.indexing, IndexingMode::Strict);
        assert!(cfg.terminates());
    }

    #[test]
    fn with_flags_overrides_env_indexing() {
        let env: HashMap<&str, &str> = [
            ("POOLGUARD_INDEXING", "lenient"),
            ("POOLGUARD_LOG", "off"),
        ]
        .into_iter()
        .collect();
        let base = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| (*v).to_string()));
        assert_eq!(base.indexing, IndexingMode::Lenient);
        let cfg = base.clone().with_flags(true, false, false);
        assert_eq!(cfg.indexing, IndexingMode::Strict);
        assert_eq!(cfg.log, LogDestination::Off);
        let cfg = RuntimeConfig::default().with_flags(false, true, false);
        assert_eq!(cfg.indexing, IndexingMode::Lenient);
        assert!(cfg.rewrites());
        assert!(!cfg.dangling);
    }

    #[test]
    fn from_lookup_reads_every_key() {
        let env: HashMap<&str, &str> = [
            ("POOLGUARD_DANGLING", "1"),
            ("POOLGUARD_REWRITE_OOB", "yes"),
            ("POOLGUARD_INDEXING", "strict"),
            ("POOLGUARD_MODE", "audit"),
            ("POOLGUARD_LOG", "/tmp/pg.jsonl"),
            ("POOLGUARD_LOG_LEVEL", "debug"),
            ("POOLGUARD_MAX_PROTECTED_SHADOWS", "9"),
            ("POOLGUARD_FAULT_HANDLER", "off"),
        ]
        .into_iter()
        .collect();
        let cfg = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| (*v).to_string()));
        assert!(cfg.dangling);
        assert!(cfg.rewrite_oob);
        assert_eq!(cfg.indexing, IndexingMode::Strict);
        assert_eq!(cfg.mode, CheckMode::Audit);
        assert!(!cfg.rewrites());
        assert_eq!(cfg.log, LogDestination::File(PathBuf::from("/tmp/pg.jsonl")));
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.shadow.max_protected, 9);
        assert!(!cfg.fault_handler);
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let cfg = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn loose_parsers() {
        assert_eq!(IndexingMode::from_str_loose("LENIENT"), IndexingMode::Lenient);
        assert_eq!(IndexingMode::from_str_loose("whatever"), IndexingMode::Strict);
        assert_eq!(CheckMode::from_str_loose("OFF"), CheckMode::Off);
        assert!(!CheckMode::Off.checks_enabled());
        assert_eq!(LogDestination::from_str_loose("-"), LogDestination::Stderr);
        assert_eq!(LogDestination::from_str_loose("memory"), LogDestination::Memory);
    }

    #[test]
    fn check_mode_is_stable() {
        assert_eq!(check_mode(), check_mode());
    }
}
