//! Long-term memory core for a conversational agent: identity resolution,
//! conversation capture into daily cold-storage logs, and the offline
//! maintenance pipeline that promotes durable facts into an external store.

pub mod analysis;
pub mod capture;
pub mod chunk;
pub mod digest;
pub mod identity;
pub mod log_store;
pub mod oracle;
pub mod sanitize;
pub mod schema;
pub mod scheduler;
pub mod store;

pub use capture::capture_turn;
pub use digest::DigestWriter;
pub use log_store::{LogStore, SearchHit, SearchOptions};
pub use oracle::TextOracle;
pub use schema::{LogEntry, LogMessage, MemoryItem, Role, SleepAnalysis};
pub use scheduler::{MaintenanceOptions, MaintenanceReport, MaintenanceScheduler, MaintenanceTuning};
pub use store::{LocalStore, MemoryStore, PlatformStore};
