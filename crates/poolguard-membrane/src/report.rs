//! Violation records and the violation log.
//!
//! Every violation is written as one JSONL line to the configured sink. When
//! the sink is stderr or a file, a one-line human-readable alert also goes to
//! stderr.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::LogDestination;
use crate::registry::{ObjectClass, ObjectSpan, Provenance, SourceLoc};

/// Violations kept in memory for [`ViolationLog::recent`].
pub const RECENT_VIOLATIONS: usize = 256;

/// Kinds of memory-safety violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// No live object covers the pointer.
    UnregisteredAccess,
    /// The pointer is outside the bounds of its object.
    OutOfBounds,
    /// Free of something that is not the start of a live heap object.
    InvalidFree,
    /// Free of an object that was already freed.
    DoubleFree,
    /// Access to a freed object.
    DanglingAccess,
    /// Pointer does not sit at the expected offset of a pool element.
    Misaligned,
    /// Indirect call to a function outside the permitted target set.
    InvalidCallTarget,
}

impl ViolationKind {
    /// Default CWE identifier for the kind.
    #[must_use]
    pub const fn cwe(self) -> u32 {
        match self {
            Self::UnregisteredAccess => 822,
            Self::OutOfBounds => 119,
            Self::InvalidFree => 763,
            Self::DoubleFree => 415,
            Self::DanglingAccess => 416,
            Self::Misaligned | Self::InvalidCallTarget => 119,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnregisteredAccess => "UnregisteredAccess",
            Self::OutOfBounds => "OutOfBounds",
            Self::InvalidFree => "InvalidFree",
            Self::DoubleFree => "DoubleFree",
            Self::DanglingAccess => "DanglingAccess",
            Self::Misaligned => "Misaligned",
            Self::InvalidCallTarget => "InvalidCallTarget",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} at {fault_addr:#x}")]
pub struct Violation {
    pub kind: ViolationKind,
    pub cwe: u32,
    pub fault_addr: usize,
    pub fault_pc: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_class: Option<ObjectClass>,
    /// Source location of the failing check or free.
    #[serde(rename = "source", skip_serializing_if = "Option::is_none")]
    pub site: Option<SourceLoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Violation {
    #[must_use]
    pub fn new(kind: ViolationKind, fault_addr: usize) -> Self {
        Self {
            kind,
            cwe: kind.cwe(),
            fault_addr,
            fault_pc: 0,
            pool: None,
            object_start: None,
            object_len: None,
            object_class: None,
            site: None,
            provenance: None,
            detail: String::new(),
        }
    }

    #[must_use]
    pub fn with_pc(mut self, pc: usize) -> Self {
        self.fault_pc = pc;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Option<u32>) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_object(mut self, span: ObjectSpan, class: Option<ObjectClass>) -> Self {
        self.object_start = Some(span.start);
        self.object_len = Some(span.len());
        self.object_class = class;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Option<SourceLoc>) -> Self {
        self.site = source;
        self
    }

    #[must_use]
    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance;
        self
    }

    #[must_use]
    pub fn with_cwe(mut self, cwe: u32) -> Self {
        self.cwe = cwe;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Single-line human-readable alert.
    #[must_use]
    pub fn alert(&self) -> String {
        let mut line = format!(
            "poolguard: {} (CWE-{}) at {:#x} pc {:#x}",
            self.kind, self.cwe, self.fault_addr, self.fault_pc
        );
        if let (Some(start), Some(len)) = (self.object_start, self.object_len) {
            line.push_str(&format!("; object {start:#x}+{len}"));
            if let Some(class) = self.object_class {
                line.push_str(&format!(" [{}]", class.as_str()));
            }
        }
        if let Some(src) = &self.site {
            line.push_str(&format!("; at {src}"));
        }
        if let Some(prov) = &self.provenance {
            if let Some(site) = &prov.alloc_site {
                line.push_str(&format!("; allocated at {site}"));
            }
            if let Some(site) = &prov.free_site {
                line.push_str(&format!("; freed at {site}"));
            }
        }
        if !self.detail.is_empty() {
            line.push_str("; ");
            line.push_str(&self.detail);
        }
        line
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

enum Sink {
    Stderr,
    File(BufWriter<File>),
    /// Newest [`RECENT_VIOLATIONS`] JSONL lines.
    Memory(VecDeque<String>),
    Off,
}

/// Destination of violation reports plus a ring of recent ones.
pub struct ViolationLog {
    sink: Mutex<Sink>,
    recent: Mutex<VecDeque<Violation>>,
    count: AtomicU64,
}

impl ViolationLog {
    pub fn open(dest: &LogDestination) -> std::io::Result<Self> {
        let sink = match dest {
            LogDestination::Stderr => Sink::Stderr,
            LogDestination::File(path) => Sink::File(BufWriter::new(File::create(path)?)),
            LogDestination::Memory => Sink::Memory(VecDeque::new()),
            LogDestination::Off => Sink::Off,
        };
        Ok(Self {
            sink: Mutex::new(sink),
            recent: Mutex::new(VecDeque::new()),
            count: AtomicU64::new(0),
        })
    }

    /// Log one violation. Sink write failures are swallowed: reporting must
    /// never turn into a second failure inside the checked program.
    pub fn record(&self, violation: &Violation) {
        self.count.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_VIOLATIONS {
                recent.pop_front();
            }
            recent.push_back(violation.clone());
        }
        let Ok(line) = violation.to_jsonl() else {
            return;
        };
        let mut sink = self.sink.lock();
        match &mut *sink {
            Sink::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", violation.alert());
                let _ = writeln!(err, "{line}");
            }
            Sink::File(w) => {
                let _ = writeln!(w, "{line}");
                let _ = writeln!(std::io::stderr(), "{}", violation.alert());
            }
            Sink::Memory(lines) => {
                if lines.len() == RECENT_VIOLATIONS {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
            Sink::Off => {}
        }
    }

    /// Total violations recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Most recent violations, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<Violation> {
        self.recent.lock().iter().cloned().collect()
    }

    /// JSONL lines held by a memory sink.
    #[must_use]
    pub fn memory_lines(&self) -> Vec<String> {
        match &*self.sink.lock() {
            Sink::Memory(lines) => lines.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn flush(&self) {
        if let Sink::File(w) = &mut *self.sink.lock() {
            let _ = w.flush();
        }
    }
}

impl Drop for ViolationLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Violation {
        Violation::new(ViolationKind::OutOfBounds, 0x1064)
            .with_pc(0x4000)
            .with_pool(Some(1))
            .with_object(ObjectSpan::new(0x1000, 64), Some(ObjectClass::Heap))
            .with_source(Some(SourceLoc::new("main.c", 12)))
            .with_provenance(Some(Provenance {
                alloc_id: 3,
                alloc_site: Some(SourceLoc::new("main.c", 4)),
                ..Provenance::default()
            }))
    }

    #[test]
    fn cwe_defaults_follow_kind() {
        assert_eq!(ViolationKind::DanglingAccess.cwe(), 416);
        assert_eq!(ViolationKind::DoubleFree.cwe(), 415);
        assert_eq!(Violation::new(ViolationKind::OutOfBounds, 1).cwe, 119);
        assert_eq!(
            Violation::new(ViolationKind::InvalidFree, 1).with_cwe(590).cwe,
            590
        );
    }

    #[test]
    fn alert_mentions_object_and_sites() {
        let alert = sample().alert();
        assert!(alert.contains("OutOfBounds (CWE-119) at 0x1064"));
        assert!(alert.contains("object 0x1000+64 [heap]"));
        assert!(alert.contains("at main.c:12"));
        assert!(alert.contains("allocated at main.c:4"));
        assert_eq!(sample().to_string(), "OutOfBounds at 0x1064");
    }

    #[test]
    fn jsonl_round_trips() {
        let v = sample();
        let line = v.to_jsonl().unwrap();
        let back: Violation = serde_json::from_str(&line).unwrap();
        assert_eq!(back, v);
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["kind"], "OutOfBounds");
        assert_eq!(json["object_class"], "heap");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn memory_sink_keeps_lines() {
        let log = ViolationLog::open(&LogDestination::Memory).unwrap();
        log.record(&sample());
        log.record(&Violation::new(ViolationKind::DoubleFree, 0x2000));
        assert_eq!(log.count(), 2);
        assert_eq!(log.memory_lines().len(), 2);
        assert_eq!(log.recent()[1].kind, ViolationKind::DoubleFree);
    }

    #[test]
    fn memory_sink_is_bounded() {
        let log = ViolationLog::open(&LogDestination::Memory).unwrap();
        for addr in 0..RECENT_VIOLATIONS + 10 {
            log.record(&Violation::new(ViolationKind::OutOfBounds, addr));
        }
        let lines = log.memory_lines();
        assert_eq!(lines.len(), RECENT_VIOLATIONS);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["fault_addr"], 10);
        assert_eq!(log.count(), (RECENT_VIOLATIONS + 10) as u64);
    }

    #[test]
    fn source_location_keeps_its_json_key() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_jsonl().unwrap()).unwrap();
        assert_eq!(json["source"]["file"], "main.c");
        assert_eq!(json["source"]["line"], 12);
        let err: &dyn std::error::Error = &sample();
        assert!(err.source().is_none());
    }

    #[test]
    fn file_sink_writes_jsonl() {
        let path = std::env::temp_dir()
            .join(format!("poolguard-report-{}.jsonl", std::process::id()));
        {
            let log = ViolationLog::open(&LogDestination::File(path.clone())).unwrap();
            log.record(&sample());
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
