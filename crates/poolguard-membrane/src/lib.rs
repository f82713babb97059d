//! Memory-safety runtime core for poolguard.
//!
//! Instrumented programs allocate through pools, register the objects they
//! create, and ask the runtime to validate pointer arithmetic and
//! dereferences. The runtime tracks every live object by address range,
//! rewrites temporarily out-of-bounds pointers into tokens that can be compared
//! but never dereferenced, and detects accesses to freed objects through
//! protected shadow pages.
//!
//! # Architecture
//!
//! - **Page provider** (`page`): map, unmap, alias and protect pages; page cache
//! - **Slabs and pools** (`slab`, `pool`): same-size-class allocation with
//!   per-slab bitmaps
//! - **Range map** (`splay`): top-down splay tree over disjoint address ranges
//! - **Registry** (`registry`): live objects of one pool behind a 2-entry cache
//! - **Tokens** (`oob`): out-of-bounds pointer rewriting
//! - **Dangling detector** (`dangling`): shadow pages and freed-object records
//! - **Runtime** (`runtime`, `check`): the context every entry point goes
//!   through, and the bounds/deref checks
//! - **Reporting** (`report`, `log`, `metrics`): violations, lifecycle records,
//!   atomic counters
//! - **Configuration** (`config`): runtime flags and the process-wide mode

#![deny(unsafe_code)]

pub mod check;
pub mod config;
pub mod dangling;
pub mod log;
pub mod metrics;
pub mod oob;
pub mod page;
pub mod pool;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod slab;
pub mod splay;

pub use check::{CheckOutcome, CheckSite, FaultResolution};
pub use config::{CheckMode, IndexingMode, LogDestination, RuntimeConfig, ShadowPolicy};
pub use log::{LogLevel, RuntimeLogRecord};
pub use metrics::MetricsSnapshot;
pub use page::{MmapPages, PageError, PageProvider};
pub use registry::{ObjectClass, ObjectMeta, ObjectSpan, Provenance, RegisterOutcome, SourceLoc};
pub use report::{Violation, ViolationKind};
pub use runtime::{CallSite, FrameMark, FreeOutcome, PoolId, Runtime, RuntimeError};
