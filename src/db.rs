//! SQLite access layer.
//!
//! `CrmDb` owns the connection and the schema; the component modules
//! (`pipeline`, `leads`, `handoff`, `query`) add their operations as
//! inherent impls on it. All multi-row writes go through
//! `unchecked_transaction()` so a mutation, its projection update, and
//! its audit entry commit as one unit or not at all.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};

use crate::errors::{CrmError, Result};
use crate::models::*;

/// Current time as RFC 3339 with millisecond precision. Fixed-width UTC
/// timestamps sort lexicographically, which cursor pagination relies on.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Async handle ──────────────────────────────────────────────────────

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CrmError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| CrmError::Other(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    /// Acquire the database mutex synchronously. For startup, tests, and
    /// other contexts where blocking is acceptable; must not be called
    /// from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner.lock().map_err(|_| CrmError::LockPoisoned)
    }
}

// ── Database ──────────────────────────────────────────────────────────

pub struct CrmDb {
    pub(crate) conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(CrmError::Other)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(CrmError::Other)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS boards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                display_order INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id INTEGER NOT NULL,
                board_id INTEGER NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                position INTEGER NOT NULL,
                is_closed_won INTEGER NOT NULL DEFAULT 0,
                is_closed_lost INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                board_id INTEGER NOT NULL REFERENCES boards(id),
                stage_id INTEGER NOT NULL REFERENCES stages(id),
                assigned_to TEXT,
                value REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'USD',
                priority TEXT NOT NULL DEFAULT 'medium',
                temperature TEXT NOT NULL DEFAULT 'warm',
                tags TEXT NOT NULL DEFAULT '[]',
                qualification TEXT,
                conversation_status TEXT NOT NULL DEFAULT 'new',
                handoff_state TEXT,
                custom_fields TEXT NOT NULL DEFAULT '{}',
                closed_at TEXT,
                closed_type TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- lead_id is deliberately not a foreign key: handoff history
            -- outlives the lead it belonged to.
            CREATE TABLE IF NOT EXISTS handoffs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id INTEGER NOT NULL,
                lead_id INTEGER NOT NULL,
                from_member_id TEXT NOT NULL,
                to_member_id TEXT,
                reason TEXT NOT NULL,
                summary TEXT,
                suggested_actions TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                resolution_notes TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                changes TEXT NOT NULL DEFAULT '{}',
                description TEXT NOT NULL,
                severity TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_boards_org ON boards(organization_id, display_order);
            CREATE INDEX IF NOT EXISTS idx_stages_board ON stages(board_id, position);
            CREATE INDEX IF NOT EXISTS idx_leads_org_board ON leads(organization_id, board_id);
            CREATE INDEX IF NOT EXISTS idx_leads_org_stage ON leads(organization_id, stage_id);
            CREATE INDEX IF NOT EXISTS idx_leads_org_created ON leads(organization_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_handoffs_lead ON handoffs(lead_id);
            CREATE INDEX IF NOT EXISTS idx_handoffs_org_created ON handoffs(organization_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_logs(organization_id, entity_type, entity_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_org_created ON audit_logs(organization_id, created_at, id);

            -- Schema-level backstops for invariants the code also checks:
            -- at most one pending handoff per lead, at most one default
            -- board per organization.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_handoffs_pending
                ON handoffs(lead_id) WHERE status = 'pending';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_boards_default
                ON boards(organization_id) WHERE is_default = 1;
            ",
        )?;
        Ok(())
    }

    // ── Single-row getters (organization-scoped) ──────────────────────

    pub fn get_board(&self, org_id: i64, id: i64) -> Result<Option<Board>> {
        fetch_board(&self.conn, org_id, id)
    }

    pub fn get_stage(&self, org_id: i64, id: i64) -> Result<Option<Stage>> {
        fetch_stage(&self.conn, org_id, id)
    }

    pub fn get_lead(&self, org_id: i64, id: i64) -> Result<Option<Lead>> {
        fetch_lead(&self.conn, org_id, id)
    }

    pub fn get_handoff(&self, org_id: i64, id: i64) -> Result<Option<Handoff>> {
        fetch_handoff(&self.conn, org_id, id)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

pub(crate) const BOARD_COLUMNS: &str =
    "id, organization_id, name, is_default, display_order, created_at";

pub(crate) const STAGE_COLUMNS: &str =
    "id, organization_id, board_id, name, position, is_closed_won, is_closed_lost, created_at";

pub(crate) const LEAD_COLUMNS: &str = "id, organization_id, title, contact_id, board_id, stage_id, \
     assigned_to, value, currency, priority, temperature, tags, qualification, \
     conversation_status, handoff_state, custom_fields, closed_at, closed_type, \
     created_at, updated_at";

pub(crate) const HANDOFF_COLUMNS: &str = "id, organization_id, lead_id, from_member_id, to_member_id, reason, summary, \
     suggested_actions, status, resolution_notes, created_at, resolved_at";

pub(crate) const AUDIT_COLUMNS: &str = "id, organization_id, entity_type, entity_id, action, actor_id, actor_type, \
     changes, description, severity, created_at";

pub(crate) fn map_board(row: &rusqlite::Row<'_>) -> rusqlite::Result<Board> {
    Ok(Board {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        is_default: row.get(3)?,
        display_order: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(crate) fn map_stage(row: &rusqlite::Row<'_>) -> rusqlite::Result<Stage> {
    Ok(Stage {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        board_id: row.get(2)?,
        name: row.get(3)?,
        position: row.get(4)?,
        is_closed_won: row.get(5)?,
        is_closed_lost: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Raw lead row; enum and JSON columns still unparsed.
pub(crate) struct LeadRow {
    id: i64,
    organization_id: i64,
    title: String,
    contact_id: String,
    board_id: i64,
    stage_id: i64,
    assigned_to: Option<String>,
    value: f64,
    currency: String,
    priority: String,
    temperature: String,
    tags: String,
    qualification: Option<String>,
    conversation_status: String,
    handoff_state: Option<String>,
    custom_fields: String,
    closed_at: Option<String>,
    closed_type: Option<String>,
    created_at: String,
    updated_at: String,
}

impl LeadRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            title: row.get(2)?,
            contact_id: row.get(3)?,
            board_id: row.get(4)?,
            stage_id: row.get(5)?,
            assigned_to: row.get(6)?,
            value: row.get(7)?,
            currency: row.get(8)?,
            priority: row.get(9)?,
            temperature: row.get(10)?,
            tags: row.get(11)?,
            qualification: row.get(12)?,
            conversation_status: row.get(13)?,
            handoff_state: row.get(14)?,
            custom_fields: row.get(15)?,
            closed_at: row.get(16)?,
            closed_type: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    pub(crate) fn into_lead(self) -> Result<Lead> {
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| anyhow::anyhow!("corrupt tags JSON '{}': {}", self.tags, e))?;
        let qualification: Option<Qualification> = match &self.qualification {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| anyhow::anyhow!("corrupt qualification JSON: {}", e))?,
            ),
            None => None,
        };
        let handoff_state: Option<HandoffState> = match &self.handoff_state {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| anyhow::anyhow!("corrupt handoff_state JSON: {}", e))?,
            ),
            None => None,
        };
        let custom_fields: FieldMap = serde_json::from_str(&self.custom_fields)
            .map_err(|e| anyhow::anyhow!("corrupt custom_fields JSON: {}", e))?;
        let closed_type = match &self.closed_type {
            Some(s) => Some(
                ClosedType::from_str(s)
                    .map_err(|_| anyhow::anyhow!("invalid closed_type in database: '{}'", s))?,
            ),
            None => None,
        };
        Ok(Lead {
            id: self.id,
            organization_id: self.organization_id,
            title: self.title,
            contact_id: self.contact_id,
            board_id: self.board_id,
            stage_id: self.stage_id,
            assigned_to: self.assigned_to,
            value: self.value,
            currency: self.currency,
            priority: self.priority.parse().map_err(|_| {
                anyhow::anyhow!("invalid priority in database: '{}'", self.priority)
            })?,
            temperature: self.temperature.parse().map_err(|_| {
                anyhow::anyhow!("invalid temperature in database: '{}'", self.temperature)
            })?,
            tags,
            qualification,
            conversation_status: self.conversation_status.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid conversation_status in database: '{}'",
                    self.conversation_status
                )
            })?,
            handoff_state,
            custom_fields,
            closed_at: self.closed_at,
            closed_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) struct HandoffRow {
    id: i64,
    organization_id: i64,
    lead_id: i64,
    from_member_id: String,
    to_member_id: Option<String>,
    reason: String,
    summary: Option<String>,
    suggested_actions: String,
    status: String,
    resolution_notes: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl HandoffRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            lead_id: row.get(2)?,
            from_member_id: row.get(3)?,
            to_member_id: row.get(4)?,
            reason: row.get(5)?,
            summary: row.get(6)?,
            suggested_actions: row.get(7)?,
            status: row.get(8)?,
            resolution_notes: row.get(9)?,
            created_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }

    pub(crate) fn into_handoff(self) -> Result<Handoff> {
        let suggested_actions: Vec<String> = serde_json::from_str(&self.suggested_actions)
            .map_err(|e| anyhow::anyhow!("corrupt suggested_actions JSON: {}", e))?;
        Ok(Handoff {
            id: self.id,
            organization_id: self.organization_id,
            lead_id: self.lead_id,
            from_member_id: self.from_member_id,
            to_member_id: self.to_member_id,
            reason: self.reason,
            summary: self.summary,
            suggested_actions,
            status: self.status.parse().map_err(|_| {
                anyhow::anyhow!("invalid handoff status in database: '{}'", self.status)
            })?,
            resolution_notes: self.resolution_notes,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

pub(crate) struct AuditRow {
    id: i64,
    organization_id: i64,
    entity_type: String,
    entity_id: i64,
    action: String,
    actor_id: String,
    actor_type: String,
    changes: String,
    description: String,
    severity: String,
    created_at: String,
}

impl AuditRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            action: row.get(4)?,
            actor_id: row.get(5)?,
            actor_type: row.get(6)?,
            changes: row.get(7)?,
            description: row.get(8)?,
            severity: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    pub(crate) fn into_entry(self) -> Result<AuditLogEntry> {
        let changes: AuditChanges = serde_json::from_str(&self.changes)
            .map_err(|e| anyhow::anyhow!("corrupt changes JSON: {}", e))?;
        Ok(AuditLogEntry {
            id: self.id,
            organization_id: self.organization_id,
            entity_type: self.entity_type.parse().map_err(|_| {
                anyhow::anyhow!("invalid entity_type in database: '{}'", self.entity_type)
            })?,
            entity_id: self.entity_id,
            action: self.action.parse().map_err(|_| {
                anyhow::anyhow!("invalid action in database: '{}'", self.action)
            })?,
            actor_id: self.actor_id,
            actor_type: self.actor_type.parse().map_err(|_| {
                anyhow::anyhow!("invalid actor_type in database: '{}'", self.actor_type)
            })?,
            changes,
            description: self.description,
            severity: self.severity.parse().map_err(|_| {
                anyhow::anyhow!("invalid severity in database: '{}'", self.severity)
            })?,
            created_at: self.created_at,
        })
    }
}

// ── In-transaction fetch helpers ──────────────────────────────────────
//
// Free functions over `&Connection` so component modules can read inside
// an open transaction (`Transaction` derefs to `Connection`).

pub(crate) fn fetch_board(conn: &Connection, org_id: i64, id: i64) -> Result<Option<Board>> {
    let sql = format!(
        "SELECT {} FROM boards WHERE id = ?1 AND organization_id = ?2",
        BOARD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id, org_id], map_board)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub(crate) fn fetch_stage(conn: &Connection, org_id: i64, id: i64) -> Result<Option<Stage>> {
    let sql = format!(
        "SELECT {} FROM stages WHERE id = ?1 AND organization_id = ?2",
        STAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id, org_id], map_stage)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub(crate) fn fetch_lead(conn: &Connection, org_id: i64, id: i64) -> Result<Option<Lead>> {
    let sql = format!(
        "SELECT {} FROM leads WHERE id = ?1 AND organization_id = ?2",
        LEAD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id, org_id], LeadRow::from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?.into_lead()?)),
        None => Ok(None),
    }
}

pub(crate) fn fetch_handoff(conn: &Connection, org_id: i64, id: i64) -> Result<Option<Handoff>> {
    let sql = format!(
        "SELECT {} FROM handoffs WHERE id = ?1 AND organization_id = ?2",
        HANDOFF_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id, org_id], HandoffRow::from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?.into_handoff()?)),
        None => Ok(None),
    }
}

/// Id of the lead's pending handoff, if one exists.
pub(crate) fn pending_handoff_id(conn: &Connection, lead_id: i64) -> Result<Option<i64>> {
    let mut stmt =
        conn.prepare("SELECT id FROM handoffs WHERE lead_id = ?1 AND status = 'pending'")?;
    let mut rows = stmt.query_map(params![lead_id], |row| row.get::<_, i64>(0))?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}
