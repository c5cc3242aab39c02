pub mod usage;
pub mod period;
pub mod store;
pub mod transport;
pub mod errors;
pub mod retry;
pub mod circuit_breaker;
pub mod throttle;
pub mod client;
pub mod token;
pub mod stats;
pub mod renewer;
pub mod config;
pub mod api;

// Re-export key types
pub use usage::{refresh_usage, renewal_payload, sanitize_usage_doc, zero_usage, Measure, UsageDoc, UsageType};
pub use store::{CarryOverRecord, CarryOverStore, MemoryStore, RecordState, UsageKey};
pub use transport::{CollectorResponse, RequestOptions, Transport};
pub use errors::{PassError, RecordError};
pub use client::CollectorClient;
pub use renewer::{Callbacks, Renewer};
pub use stats::RenewalStats;
pub use config::RenewerConfig;
