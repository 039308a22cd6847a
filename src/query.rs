//! Query Façade: filtered, cursor-paginated listings.
//!
//! All listings share one shape: filters AND together, ordering is
//! `created_at DESC, id DESC`, and the cursor is an opaque hex token
//! carrying the `(created_at, id)` of the last row served. Timestamps
//! are fixed-width UTC strings, so string comparison in SQL matches
//! chronological order and the `(created_at, id)` pair totally orders
//! every table.

use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::db::{AUDIT_COLUMNS, AuditRow, CrmDb, HANDOFF_COLUMNS, HandoffRow, LEAD_COLUMNS, LeadRow};
use crate::errors::{CrmError, Result};
use crate::models::*;

/// Hard ceiling on page size; requested limits clamp to `1..=200`.
pub const MAX_PAGE_SIZE: i64 = 200;

// ── Cursor token ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Cursor {
    created_at: String,
    id: i64,
}

fn encode_cursor(created_at: &str, id: i64) -> Result<String> {
    let cursor = Cursor {
        created_at: created_at.to_string(),
        id,
    };
    let bytes = serde_json::to_vec(&cursor)
        .map_err(|e| anyhow::anyhow!("Failed to encode cursor: {}", e))?;
    Ok(hex::encode(bytes))
}

fn decode_cursor(raw: &str) -> Result<Cursor> {
    let bytes = hex::decode(raw)
        .map_err(|_| CrmError::Validation(format!("malformed pagination cursor: '{}'", raw)))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| CrmError::Validation(format!("malformed pagination cursor: '{}'", raw)))
}

fn finish_page<T>(
    mut items: Vec<T>,
    limit: i64,
    key: impl Fn(&T) -> (&str, i64),
) -> Result<Page<T>> {
    let has_more = items.len() as i64 > limit;
    if has_more {
        items.truncate(limit as usize);
    }
    let next_cursor = match (has_more, items.last()) {
        (true, Some(last)) => {
            let (created_at, id) = key(last);
            Some(encode_cursor(created_at, id)?)
        }
        _ => None,
    };
    Ok(Page {
        items,
        next_cursor,
        has_more,
    })
}

// ── Filters ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditLogFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<i64>,
    pub action: Option<AuditAction>,
    pub actor_id: Option<String>,
    pub severity: Option<Severity>,
    /// Inclusive RFC 3339 lower bound on `created_at`.
    pub since: Option<String>,
    /// Inclusive RFC 3339 upper bound on `created_at`.
    pub until: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadFilter {
    pub board_id: Option<i64>,
    pub stage_id: Option<i64>,
    pub assigned_to: Option<String>,
}

/// Accumulates `WHERE` clauses and their bind values in lockstep.
struct ListQuery {
    clauses: Vec<&'static str>,
    binds: Vec<SqlValue>,
}

impl ListQuery {
    fn scoped_to(org_id: i64) -> Self {
        Self {
            clauses: vec!["organization_id = ?"],
            binds: vec![org_id.into()],
        }
    }

    fn filter(&mut self, clause: &'static str, value: impl Into<SqlValue>) {
        self.clauses.push(clause);
        self.binds.push(value.into());
    }

    fn after(&mut self, cursor: Option<&str>) -> Result<()> {
        if let Some(raw) = cursor {
            let cursor = decode_cursor(raw)?;
            self.clauses
                .push("(created_at < ? OR (created_at = ? AND id < ?))");
            self.binds.push(cursor.created_at.clone().into());
            self.binds.push(cursor.created_at.into());
            self.binds.push(cursor.id.into());
        }
        Ok(())
    }

    /// Final SQL over the given table; fetches one row past `limit` so
    /// the caller can tell whether more rows exist.
    fn into_sql(mut self, columns: &str, table: &str, limit: i64) -> (String, Vec<SqlValue>) {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY created_at DESC, id DESC LIMIT ?",
            columns,
            table,
            self.clauses.join(" AND "),
        );
        self.binds.push((limit + 1).into());
        (sql, self.binds)
    }
}

// ── Listings ──────────────────────────────────────────────────────────

impl CrmDb {
    pub fn list_audit_logs(
        &self,
        org_id: i64,
        filter: AuditLogFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Page<AuditLogEntry>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut query = ListQuery::scoped_to(org_id);
        if let Some(entity_type) = filter.entity_type {
            query.filter("entity_type = ?", entity_type.as_str().to_string());
        }
        if let Some(entity_id) = filter.entity_id {
            query.filter("entity_id = ?", entity_id);
        }
        if let Some(action) = filter.action {
            query.filter("action = ?", action.as_str().to_string());
        }
        if let Some(actor_id) = filter.actor_id {
            query.filter("actor_id = ?", actor_id);
        }
        if let Some(severity) = filter.severity {
            query.filter("severity = ?", severity.as_str().to_string());
        }
        if let Some(since) = filter.since {
            query.filter("created_at >= ?", since);
        }
        if let Some(until) = filter.until {
            query.filter("created_at <= ?", until);
        }
        query.after(cursor)?;

        let (sql, binds) = query.into_sql(AUDIT_COLUMNS, "audit_logs", limit);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), AuditRow::from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_entry()?);
        }
        tracing::debug!(org_id, returned = items.len(), "audit log page served");
        finish_page(items, limit, |e| (e.created_at.as_str(), e.id))
    }

    pub fn list_handoffs(
        &self,
        org_id: i64,
        status: Option<HandoffStatus>,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Page<Handoff>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut query = ListQuery::scoped_to(org_id);
        if let Some(status) = status {
            query.filter("status = ?", status.as_str().to_string());
        }
        query.after(cursor)?;

        let (sql, binds) = query.into_sql(HANDOFF_COLUMNS, "handoffs", limit);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), HandoffRow::from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_handoff()?);
        }
        finish_page(items, limit, |h| (h.created_at.as_str(), h.id))
    }

    pub fn list_leads(
        &self,
        org_id: i64,
        filter: LeadFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Page<Lead>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut query = ListQuery::scoped_to(org_id);
        if let Some(board_id) = filter.board_id {
            query.filter("board_id = ?", board_id);
        }
        if let Some(stage_id) = filter.stage_id {
            query.filter("stage_id = ?", stage_id);
        }
        if let Some(assigned_to) = filter.assigned_to {
            query.filter("assigned_to = ?", assigned_to);
        }
        query.after(cursor)?;

        let (sql, binds) = query.into_sql(LEAD_COLUMNS, "leads", limit);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), LeadRow::from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_lead()?);
        }
        finish_page(items, limit, |l| (l.created_at.as_str(), l.id))
    }
}
