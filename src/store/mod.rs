//! Persistence layer — libSQL-backed storage for members and the follow-up ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{FollowupLedger, MemberStore};
