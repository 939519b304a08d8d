//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! pool / h2 / proxy
//!     → tracing macros → logging.rs (EnvFilter + fmt or JSON layer)
//!     → metrics.rs helpers → metrics facade → Prometheus exporter (optional)
//! ```
//!
//! # Design Decisions
//! - Metric names live in one place so call sites stay one-liners
//! - Without an installed exporter every metric call is a no-op

pub mod logging;
pub mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::init_metrics;
