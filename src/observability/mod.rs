//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (named counters and gauges via the metrics facade)
//!
//! Consumers:
//!     → Log output configured by the binary
//!     → Whatever metrics recorder the embedding process installs
//! ```
//!
//! # Design Decisions
//! - Library code only emits; the binary owns subscriber setup
//! - Metric names are constants so tests and dashboards agree
//! - Counter updates are fire-and-forget and never read back

pub mod logging;
pub mod metrics;
