//! Lead lifecycle core for a multi-tenant CRM.
//!
//! Everything hangs off [`CrmDb`], a SQLite-backed store whose component
//! modules add their operations as inherent impls:
//!
//! - `pipeline`: boards and ordered stages, with closed-won/closed-lost
//!   markers
//! - `leads`: lead CRUD, stage movement, assignment
//! - `handoff`: human↔AI ownership transfer (`pending → accepted |
//!   rejected`)
//! - `audit`: append-only mutation log written in the same transaction
//!   as the mutation it describes
//! - `query`: cursor-paginated, filtered listings over all of the above
//!
//! Async callers go through [`DbHandle`], which serializes access behind
//! a mutex and runs it on tokio's blocking pool. Every operation takes
//! an `organization_id`; rows from one organization are never visible to
//! another.

pub mod audit;
pub mod db;
pub mod errors;
pub mod handoff;
pub mod leads;
pub mod models;
pub mod pipeline;
pub mod query;

pub use audit::{AuditEvent, default_severity, diff_changes};
pub use db::{CrmDb, DbHandle};
pub use errors::{CrmError, Result};
pub use handoff::HandoffRequest;
pub use leads::{CreateLeadRequest, HIGH_VALUE_THRESHOLD, UpdateLeadRequest};
pub use models::*;
pub use query::{AuditLogFilter, LeadFilter, MAX_PAGE_SIZE};
