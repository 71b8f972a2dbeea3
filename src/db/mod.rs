//! Database module: row models and SQL repositories.
//!
//! - `model`: row structs returned by repositories.
//! - `repo`: SQL-only functions for the collaborator tables (groups, members,
//!   events, preferences) and for notification records.
//!
//! The reminder ledger and the batch queue own their tables and keep their SQL
//! in `crate::ledger` and `crate::queue`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EventRow, GroupRow, MemberContact};
