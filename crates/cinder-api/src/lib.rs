//! Cinder API - HTTP Surface
//!
//! The security-critical middleware chain, the execute handlers (JSON and
//! SSE), the audit sink, metrics exposition, and the advisory escape
//! detector.

pub mod audit;
pub mod detector;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod ratelimit;
pub mod router;
pub mod server;
pub mod stream;
pub mod types;

pub use audit::{AuditLogger, AuditRecord, AuditStore, AuditWorker, InMemoryAuditStore};
pub use detector::{Detection, EscapeDetector, Severity};
pub use handlers::ApiState;
pub use metrics::Metrics;
pub use ratelimit::IpRateLimiter;
pub use router::build_router;
pub use server::ApiServer;
