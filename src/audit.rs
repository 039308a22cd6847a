//! Audit Recorder: immutable, append-only mutation log.
//!
//! `record` runs inside the caller's transaction. If the insert fails,
//! the error propagates and the surrounding mutation rolls back with it,
//! so "mutation committed but audit entry missing" cannot happen.

use rusqlite::{Connection, params};

use crate::db::{self, AUDIT_COLUMNS, AuditRow};
use crate::errors::Result;
use crate::models::*;

/// One mutation observed by the recorder. `severity: None` falls back to
/// the static policy table.
pub struct AuditEvent {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub action: AuditAction,
    pub before: FieldMap,
    pub after: FieldMap,
    pub description: String,
    pub severity: Option<Severity>,
}

/// Static severity policy, keyed by `(entityType, action)`. Callers may
/// override per event (handoff acceptance downgrades to low; deleting a
/// high-value lead escalates to high).
pub fn default_severity(entity: EntityType, action: AuditAction) -> Severity {
    match (entity, action) {
        (EntityType::Lead, AuditAction::Handoff) => Severity::Medium,
        (_, AuditAction::Delete) => Severity::Medium,
        (_, AuditAction::Handoff) => Severity::Medium,
        (
            _,
            AuditAction::Create | AuditAction::Update | AuditAction::Move | AuditAction::Assign,
        ) => Severity::Low,
    }
}

/// Reduce full before/after field maps to the minimal diff: only keys
/// whose values differ are retained, and keys absent from both sides are
/// omitted entirely.
pub fn diff_changes(before: &FieldMap, after: &FieldMap) -> AuditChanges {
    let mut changes = AuditChanges::default();
    for key in before.keys().chain(after.keys()) {
        if changes.before.contains_key(key) || changes.after.contains_key(key) {
            continue;
        }
        let b = before.get(key);
        let a = after.get(key);
        if b != a {
            if let Some(v) = b {
                changes.before.insert(key.clone(), v.clone());
            }
            if let Some(v) = a {
                changes.after.insert(key.clone(), v.clone());
            }
        }
    }
    changes
}

/// Append one entry within the caller's open transaction. Returns the
/// entry id. Never fails except on storage errors, which propagate.
pub(crate) fn record(
    conn: &Connection,
    org_id: i64,
    actor: &Actor,
    event: AuditEvent,
) -> Result<i64> {
    let changes = diff_changes(&event.before, &event.after);
    let changes_json = serde_json::to_string(&changes)
        .map_err(|e| anyhow::anyhow!("Failed to serialize audit changes: {}", e))?;
    let severity = event
        .severity
        .unwrap_or_else(|| default_severity(event.entity_type, event.action));

    conn.execute(
        "INSERT INTO audit_logs (organization_id, entity_type, entity_id, action, \
         actor_id, actor_type, changes, description, severity, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            org_id,
            event.entity_type.as_str(),
            event.entity_id,
            event.action.as_str(),
            actor.id,
            actor.actor_type.as_str(),
            changes_json,
            event.description,
            severity.as_str(),
            db::now_rfc3339(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!(
        entry_id = id,
        entity = %event.entity_type,
        action = %event.action,
        "audit entry recorded"
    );
    Ok(id)
}

/// Fetch one entry by id (organization-scoped). Listing goes through the
/// query facade.
pub(crate) fn fetch_entry(
    conn: &Connection,
    org_id: i64,
    id: i64,
) -> Result<Option<AuditLogEntry>> {
    let sql = format!(
        "SELECT {} FROM audit_logs WHERE id = ?1 AND organization_id = ?2",
        AUDIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id, org_id], AuditRow::from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?.into_entry()?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CrmDb;

    fn map(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_diff_drops_unchanged_fields() {
        let before = map(&[
            ("stage_id", Value::from(1i64)),
            ("title", Value::from("Acme deal")),
        ]);
        let after = map(&[
            ("stage_id", Value::from(2i64)),
            ("title", Value::from("Acme deal")),
        ]);
        let changes = diff_changes(&before, &after);
        assert_eq!(changes.before.len(), 1);
        assert_eq!(changes.after.len(), 1);
        assert_eq!(changes.before["stage_id"], Value::from(1i64));
        assert_eq!(changes.after["stage_id"], Value::from(2i64));
        assert!(!changes.before.contains_key("title"));
    }

    #[test]
    fn test_diff_of_identical_maps_is_empty() {
        let fields = map(&[("value", Value::from(5000.0))]);
        assert!(diff_changes(&fields, &fields).is_empty());
    }

    #[test]
    fn test_diff_keeps_one_sided_keys() {
        let before = map(&[("assigned_to", Value::Null)]);
        let after = map(&[("assigned_to", Value::from("user-3"))]);
        let changes = diff_changes(&before, &after);
        assert_eq!(changes.before["assigned_to"], Value::Null);
        assert_eq!(changes.after["assigned_to"], Value::from("user-3"));

        // Key only present on one side at all.
        let changes = diff_changes(&FieldMap::new(), &after);
        assert!(changes.before.is_empty());
        assert_eq!(changes.after["assigned_to"], Value::from("user-3"));
    }

    #[test]
    fn test_default_severity_table() {
        assert_eq!(
            default_severity(EntityType::Lead, AuditAction::Handoff),
            Severity::Medium
        );
        assert_eq!(
            default_severity(EntityType::Lead, AuditAction::Delete),
            Severity::Medium
        );
        assert_eq!(
            default_severity(EntityType::Lead, AuditAction::Move),
            Severity::Low
        );
        assert_eq!(
            default_severity(EntityType::Stage, AuditAction::Create),
            Severity::Low
        );
    }

    #[test]
    fn test_record_and_fetch_roundtrip() -> crate::errors::Result<()> {
        let db = CrmDb::new_in_memory()?;
        let actor = Actor::ai("ai-1");
        let id = record(
            &db.conn,
            1,
            &actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: 7,
                action: AuditAction::Move,
                before: map(&[("stage_id", Value::from(1i64))]),
                after: map(&[("stage_id", Value::from(2i64))]),
                description: "Lead moved from New to Qualified".into(),
                severity: None,
            },
        )?;

        let entry = fetch_entry(&db.conn, 1, id)?.expect("entry should exist");
        assert_eq!(entry.entity_id, 7);
        assert_eq!(entry.action, AuditAction::Move);
        assert_eq!(entry.actor_id, "ai-1");
        assert_eq!(entry.actor_type, ActorType::Ai);
        assert_eq!(entry.severity, Severity::Low);
        assert_eq!(entry.changes.after["stage_id"], Value::from(2i64));

        // Scoped reads: another organization must not see it.
        assert!(fetch_entry(&db.conn, 2, id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_caller_severity_override_wins() -> crate::errors::Result<()> {
        let db = CrmDb::new_in_memory()?;
        let id = record(
            &db.conn,
            1,
            &Actor::system(),
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: 1,
                action: AuditAction::Delete,
                before: FieldMap::new(),
                after: FieldMap::new(),
                description: "Lead deleted".into(),
                severity: Some(Severity::High),
            },
        )?;
        let entry = fetch_entry(&db.conn, 1, id)?.unwrap();
        assert_eq!(entry.severity, Severity::High);
        Ok(())
    }
}
