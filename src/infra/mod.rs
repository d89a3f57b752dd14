pub mod accounting;
pub mod callers;
pub mod db;
pub mod error_report;
pub mod identity_cache;
pub mod metrics;
