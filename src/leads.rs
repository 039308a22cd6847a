//! Lead Store: lead records and their lifecycle fields.
//!
//! Every mutation here commits together with its audit entry; the
//! `closed_at`/`closed_type` pair is owned by `move_lead_stage` and is
//! set iff the current stage is marked closed-won or closed-lost.

use rusqlite::params;
use serde::Deserialize;

use crate::audit::{self, AuditEvent};
use crate::db::{self, CrmDb, fetch_board, fetch_lead, fetch_stage, pending_handoff_id};
use crate::errors::{CrmError, Result};
use crate::models::*;

/// Leads at or above this value escalate deletion audit severity to high.
pub const HIGH_VALUE_THRESHOLD: f64 = 10_000.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateLeadRequest {
    pub title: String,
    pub contact_id: String,
    pub board_id: i64,
    /// Defaults to the board's first stage.
    pub stage_id: Option<i64>,
    pub assigned_to: Option<String>,
    pub value: f64,
    pub currency: Option<String>,
    pub priority: Option<Priority>,
    pub temperature: Option<Temperature>,
    pub tags: Vec<String>,
    pub qualification: Option<Qualification>,
    pub custom_fields: Option<FieldMap>,
}

/// Partial patch. `None` means "leave untouched"; the double-`Option`
/// fields distinguish "absent" from "set to null".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateLeadRequest {
    pub title: Option<String>,
    pub contact_id: Option<String>,
    pub value: Option<f64>,
    pub currency: Option<String>,
    pub priority: Option<Priority>,
    pub temperature: Option<Temperature>,
    pub tags: Option<Vec<String>>,
    pub qualification: Option<Option<Qualification>>,
    pub conversation_status: Option<ConversationStatus>,
    pub custom_fields: Option<FieldMap>,
}

fn qualification_value(q: &Option<Qualification>) -> Result<Value> {
    match q {
        Some(q) => {
            let json = serde_json::to_string(q)
                .map_err(|e| anyhow::anyhow!("Failed to serialize qualification: {}", e))?;
            Ok(Value::String(json))
        }
        None => Ok(Value::Null),
    }
}

/// Full field snapshot for delete audit entries. Custom fields are
/// flattened under a `custom.` prefix.
fn lead_snapshot(lead: &Lead) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    fields.insert("title".into(), lead.title.as_str().into());
    fields.insert("contact_id".into(), lead.contact_id.as_str().into());
    fields.insert("board_id".into(), lead.board_id.into());
    fields.insert("stage_id".into(), lead.stage_id.into());
    fields.insert("assigned_to".into(), lead.assigned_to.as_deref().into());
    fields.insert("value".into(), lead.value.into());
    fields.insert("currency".into(), lead.currency.as_str().into());
    fields.insert("priority".into(), lead.priority.as_str().into());
    fields.insert("temperature".into(), lead.temperature.as_str().into());
    let tags_json = serde_json::to_string(&lead.tags)
        .map_err(|e| anyhow::anyhow!("Failed to serialize tags: {}", e))?;
    fields.insert("tags".into(), tags_json.into());
    fields.insert(
        "qualification".into(),
        qualification_value(&lead.qualification)?,
    );
    fields.insert(
        "conversation_status".into(),
        lead.conversation_status.as_str().into(),
    );
    fields.insert(
        "closed_type".into(),
        lead.closed_type.map(|c| c.as_str()).into(),
    );
    fields.insert("closed_at".into(), lead.closed_at.as_deref().into());
    for (key, value) in &lead.custom_fields {
        fields.insert(format!("custom.{}", key), value.clone());
    }
    Ok(fields)
}

impl CrmDb {
    pub fn create_lead(&self, org_id: i64, req: CreateLeadRequest) -> Result<Lead> {
        if req.title.trim().is_empty() {
            return Err(CrmError::Validation("lead title must not be empty".into()));
        }
        if req.contact_id.trim().is_empty() {
            return Err(CrmError::Validation(
                "lead contact reference must not be empty".into(),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;

        fetch_board(&tx, org_id, req.board_id)?.ok_or(CrmError::NotFound {
            entity: "board",
            id: req.board_id,
        })?;

        let stage = match req.stage_id {
            Some(stage_id) => {
                let stage = fetch_stage(&tx, org_id, stage_id)?.ok_or(CrmError::NotFound {
                    entity: "stage",
                    id: stage_id,
                })?;
                if stage.board_id != req.board_id {
                    return Err(CrmError::InvalidStage {
                        stage_id,
                        board_id: req.board_id,
                    });
                }
                stage
            }
            None => {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM stages WHERE board_id = ?1 ORDER BY position, id LIMIT 1",
                    db::STAGE_COLUMNS
                ))?;
                let mut rows = stmt.query_map(params![req.board_id], db::map_stage)?;
                match rows.next() {
                    Some(row) => row?,
                    None => {
                        return Err(CrmError::Validation(format!(
                            "board {} has no stages",
                            req.board_id
                        )));
                    }
                }
            }
        };

        // Creating directly into a closed stage still stamps the closed
        // fields, keeping the stage/closed_type invariant intact.
        let closed_type = stage.closed_type();
        let closed_at = closed_type.map(|_| db::now_rfc3339());

        let tags_json = serde_json::to_string(&req.tags)
            .map_err(|e| anyhow::anyhow!("Failed to serialize tags: {}", e))?;
        let qualification_json = match &req.qualification {
            Some(q) => Some(
                serde_json::to_string(q)
                    .map_err(|e| anyhow::anyhow!("Failed to serialize qualification: {}", e))?,
            ),
            None => None,
        };
        let custom_json = serde_json::to_string(&req.custom_fields.unwrap_or_default())
            .map_err(|e| anyhow::anyhow!("Failed to serialize custom fields: {}", e))?;

        let now = db::now_rfc3339();
        tx.execute(
            "INSERT INTO leads (organization_id, title, contact_id, board_id, stage_id, \
             assigned_to, value, currency, priority, temperature, tags, qualification, \
             conversation_status, custom_fields, closed_at, closed_type, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                org_id,
                req.title,
                req.contact_id,
                req.board_id,
                stage.id,
                req.assigned_to,
                req.value,
                req.currency.as_deref().unwrap_or("USD"),
                req.priority.unwrap_or(Priority::Medium).as_str(),
                req.temperature.unwrap_or(Temperature::Warm).as_str(),
                tags_json,
                qualification_json,
                ConversationStatus::New.as_str(),
                custom_json,
                closed_at,
                closed_type.map(|c| c.as_str()),
                now,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let lead = fetch_lead(&tx, org_id, id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id,
        })?;
        tx.commit()?;

        tracing::info!(lead_id = id, board_id = lead.board_id, "lead created");
        Ok(lead)
    }

    /// Partial-field patch. Only fields present in the request are applied
    /// and diffed; a patch that changes nothing emits no audit entry.
    pub fn update_lead(
        &self,
        org_id: i64,
        lead_id: i64,
        patch: UpdateLeadRequest,
        actor: &Actor,
    ) -> Result<Lead> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(CrmError::Validation("lead title must not be empty".into()));
            }
        }

        let tx = self.conn.unchecked_transaction()?;

        let current = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;

        let mut before = FieldMap::new();
        let mut after = FieldMap::new();

        if let Some(title) = &patch.title {
            before.insert("title".into(), current.title.as_str().into());
            after.insert("title".into(), title.as_str().into());
            tx.execute(
                "UPDATE leads SET title = ?1 WHERE id = ?2",
                params![title, lead_id],
            )?;
        }
        if let Some(contact_id) = &patch.contact_id {
            before.insert("contact_id".into(), current.contact_id.as_str().into());
            after.insert("contact_id".into(), contact_id.as_str().into());
            tx.execute(
                "UPDATE leads SET contact_id = ?1 WHERE id = ?2",
                params![contact_id, lead_id],
            )?;
        }
        if let Some(value) = patch.value {
            before.insert("value".into(), current.value.into());
            after.insert("value".into(), value.into());
            tx.execute(
                "UPDATE leads SET value = ?1 WHERE id = ?2",
                params![value, lead_id],
            )?;
        }
        if let Some(currency) = &patch.currency {
            before.insert("currency".into(), current.currency.as_str().into());
            after.insert("currency".into(), currency.as_str().into());
            tx.execute(
                "UPDATE leads SET currency = ?1 WHERE id = ?2",
                params![currency, lead_id],
            )?;
        }
        if let Some(priority) = patch.priority {
            before.insert("priority".into(), current.priority.as_str().into());
            after.insert("priority".into(), priority.as_str().into());
            tx.execute(
                "UPDATE leads SET priority = ?1 WHERE id = ?2",
                params![priority.as_str(), lead_id],
            )?;
        }
        if let Some(temperature) = patch.temperature {
            before.insert("temperature".into(), current.temperature.as_str().into());
            after.insert("temperature".into(), temperature.as_str().into());
            tx.execute(
                "UPDATE leads SET temperature = ?1 WHERE id = ?2",
                params![temperature.as_str(), lead_id],
            )?;
        }
        if let Some(tags) = &patch.tags {
            let tags_json = serde_json::to_string(tags)
                .map_err(|e| anyhow::anyhow!("Failed to serialize tags: {}", e))?;
            let current_json = serde_json::to_string(&current.tags)
                .map_err(|e| anyhow::anyhow!("Failed to serialize tags: {}", e))?;
            before.insert("tags".into(), current_json.into());
            after.insert("tags".into(), tags_json.as_str().into());
            tx.execute(
                "UPDATE leads SET tags = ?1 WHERE id = ?2",
                params![tags_json, lead_id],
            )?;
        }
        if let Some(qualification) = &patch.qualification {
            let json = match qualification {
                Some(q) => Some(
                    serde_json::to_string(q)
                        .map_err(|e| anyhow::anyhow!("Failed to serialize qualification: {}", e))?,
                ),
                None => None,
            };
            before.insert(
                "qualification".into(),
                qualification_value(&current.qualification)?,
            );
            after.insert("qualification".into(), qualification_value(qualification)?);
            tx.execute(
                "UPDATE leads SET qualification = ?1 WHERE id = ?2",
                params![json, lead_id],
            )?;
        }
        if let Some(status) = patch.conversation_status {
            before.insert(
                "conversation_status".into(),
                current.conversation_status.as_str().into(),
            );
            after.insert("conversation_status".into(), status.as_str().into());
            tx.execute(
                "UPDATE leads SET conversation_status = ?1 WHERE id = ?2",
                params![status.as_str(), lead_id],
            )?;
        }
        if let Some(custom_fields) = &patch.custom_fields {
            let json = serde_json::to_string(custom_fields)
                .map_err(|e| anyhow::anyhow!("Failed to serialize custom fields: {}", e))?;
            for (key, value) in &current.custom_fields {
                before.insert(format!("custom.{}", key), value.clone());
            }
            for (key, value) in custom_fields {
                after.insert(format!("custom.{}", key), value.clone());
            }
            tx.execute(
                "UPDATE leads SET custom_fields = ?1 WHERE id = ?2",
                params![json, lead_id],
            )?;
        }

        let changes = audit::diff_changes(&before, &after);
        if changes.is_empty() {
            // Nothing actually changed; not a mutation, nothing to audit.
            return Ok(current);
        }

        tx.execute(
            "UPDATE leads SET updated_at = ?1 WHERE id = ?2",
            params![db::now_rfc3339(), lead_id],
        )?;

        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: lead_id,
                action: AuditAction::Update,
                before,
                after,
                description: format!("Lead '{}' updated", current.title),
                severity: None,
            },
        )?;

        let lead = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;
        tx.commit()?;

        tracing::info!(lead_id, "lead updated");
        Ok(lead)
    }

    /// Move a lead to another stage on its board. Entering a closed-won or
    /// closed-lost stage stamps `closed_at`/`closed_type`; leaving one
    /// clears both.
    pub fn move_lead_stage(
        &self,
        org_id: i64,
        lead_id: i64,
        new_stage_id: i64,
        actor: &Actor,
    ) -> Result<Lead> {
        let tx = self.conn.unchecked_transaction()?;

        let lead = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;
        let new_stage = fetch_stage(&tx, org_id, new_stage_id)?.ok_or(CrmError::NotFound {
            entity: "stage",
            id: new_stage_id,
        })?;
        if new_stage.board_id != lead.board_id {
            return Err(CrmError::InvalidStage {
                stage_id: new_stage_id,
                board_id: lead.board_id,
            });
        }
        if new_stage.id == lead.stage_id {
            return Ok(lead);
        }

        let old_stage = fetch_stage(&tx, org_id, lead.stage_id)?.ok_or(CrmError::NotFound {
            entity: "stage",
            id: lead.stage_id,
        })?;

        let closed_type = new_stage.closed_type();
        let closed_at = closed_type.map(|_| db::now_rfc3339());

        tx.execute(
            "UPDATE leads SET stage_id = ?1, closed_at = ?2, closed_type = ?3, updated_at = ?4 \
             WHERE id = ?5",
            params![
                new_stage_id,
                closed_at,
                closed_type.map(|c| c.as_str()),
                db::now_rfc3339(),
                lead_id
            ],
        )?;

        let mut before = FieldMap::new();
        let mut after = FieldMap::new();
        before.insert("stage_id".into(), lead.stage_id.into());
        after.insert("stage_id".into(), new_stage_id.into());
        before.insert(
            "closed_type".into(),
            lead.closed_type.map(|c| c.as_str()).into(),
        );
        after.insert("closed_type".into(), closed_type.map(|c| c.as_str()).into());
        before.insert("closed_at".into(), lead.closed_at.as_deref().into());
        after.insert("closed_at".into(), closed_at.as_deref().into());

        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: lead_id,
                action: AuditAction::Move,
                before,
                after,
                description: format!(
                    "Lead moved from '{}' to '{}'",
                    old_stage.name, new_stage.name
                ),
                severity: None,
            },
        )?;

        let lead = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;
        tx.commit()?;

        tracing::info!(lead_id, stage_id = new_stage_id, "lead moved");
        Ok(lead)
    }

    /// Assign the lead to a member, or unassign with `None`.
    pub fn assign_lead(
        &self,
        org_id: i64,
        lead_id: i64,
        assignee: Option<&str>,
        actor: &Actor,
    ) -> Result<Lead> {
        let tx = self.conn.unchecked_transaction()?;

        let lead = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;
        if lead.assigned_to.as_deref() == assignee {
            return Ok(lead);
        }

        tx.execute(
            "UPDATE leads SET assigned_to = ?1, updated_at = ?2 WHERE id = ?3",
            params![assignee, db::now_rfc3339(), lead_id],
        )?;

        let mut before = FieldMap::new();
        let mut after = FieldMap::new();
        before.insert("assigned_to".into(), lead.assigned_to.as_deref().into());
        after.insert("assigned_to".into(), assignee.into());

        let description = match assignee {
            Some(member) => format!("Lead assigned to {}", member),
            None => "Lead unassigned".to_string(),
        };
        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: lead_id,
                action: AuditAction::Assign,
                before,
                after,
                description,
                severity: None,
            },
        )?;

        let lead = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;
        tx.commit()?;

        tracing::info!(lead_id, assignee = ?assignee, "lead assignment changed");
        Ok(lead)
    }

    /// Hard delete. Refused while a pending handoff exists; the final
    /// audit entry carries a full `before` snapshot of the lead.
    pub fn delete_lead(&self, org_id: i64, lead_id: i64, actor: &Actor) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let lead = fetch_lead(&tx, org_id, lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: lead_id,
        })?;
        if pending_handoff_id(&tx, lead_id)?.is_some() {
            tracing::warn!(lead_id, "delete refused: pending handoff");
            return Err(CrmError::LeadHandoffPending { lead_id });
        }

        tx.execute("DELETE FROM leads WHERE id = ?1", params![lead_id])?;

        let severity = if lead.value >= HIGH_VALUE_THRESHOLD {
            Some(Severity::High)
        } else {
            None
        };
        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: lead_id,
                action: AuditAction::Delete,
                before: lead_snapshot(&lead)?,
                after: FieldMap::new(),
                description: format!("Lead '{}' deleted", lead.title),
                severity,
            },
        )?;

        tx.commit()?;
        tracing::info!(lead_id, "lead deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::AuditLogFilter;

    fn actor() -> Actor {
        Actor::human("user-1")
    }

    struct Fixture {
        db: CrmDb,
        board: Board,
        new: Stage,
        qualified: Stage,
        won: Stage,
    }

    fn fixture() -> Fixture {
        let db = CrmDb::new_in_memory().unwrap();
        let board = db.create_board(1, "Sales", true, &actor()).unwrap();
        let new = db
            .create_stage(1, board.id, "New", None, false, false, &actor())
            .unwrap();
        let qualified = db
            .create_stage(1, board.id, "Qualified", None, false, false, &actor())
            .unwrap();
        let won = db
            .create_stage(1, board.id, "Won", None, true, false, &actor())
            .unwrap();
        Fixture {
            db,
            board,
            new,
            qualified,
            won,
        }
    }

    fn lead_request(f: &Fixture) -> CreateLeadRequest {
        CreateLeadRequest {
            title: "Acme deal".into(),
            contact_id: "contact-1".into(),
            board_id: f.board.id,
            stage_id: Some(f.new.id),
            value: 5000.0,
            ..Default::default()
        }
    }

    fn lead_audit_entries(f: &Fixture, lead_id: i64) -> Vec<AuditLogEntry> {
        let filter = AuditLogFilter {
            entity_type: Some(EntityType::Lead),
            entity_id: Some(lead_id),
            ..Default::default()
        };
        f.db.list_audit_logs(1, filter, None, 100).unwrap().items
    }

    #[test]
    fn test_create_lead_defaults_to_first_stage() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(
            1,
            CreateLeadRequest {
                title: "No stage given".into(),
                contact_id: "contact-2".into(),
                board_id: f.board.id,
                ..Default::default()
            },
        )?;
        assert_eq!(lead.stage_id, f.new.id);
        assert_eq!(lead.priority, Priority::Medium);
        assert_eq!(lead.temperature, Temperature::Warm);
        assert_eq!(lead.currency, "USD");
        assert_eq!(lead.conversation_status, ConversationStatus::New);
        assert!(lead.handoff_state.is_none());
        assert!(lead.closed_type.is_none());
        Ok(())
    }

    #[test]
    fn test_create_lead_rejects_stage_from_other_board() -> Result<()> {
        let f = fixture();
        let other = f.db.create_board(1, "Renewals", false, &actor())?;
        let foreign = f
            .db
            .create_stage(1, other.id, "Other", None, false, false, &actor())?;

        let err = f
            .db
            .create_lead(
                1,
                CreateLeadRequest {
                    stage_id: Some(foreign.id),
                    ..lead_request(&f)
                },
            )
            .unwrap_err();
        assert!(matches!(err, CrmError::InvalidStage { .. }));
        Ok(())
    }

    #[test]
    fn test_create_lead_rejects_empty_title() -> Result<()> {
        let f = fixture();
        let err = f
            .db
            .create_lead(
                1,
                CreateLeadRequest {
                    title: " ".into(),
                    ..lead_request(&f)
                },
            )
            .unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
        Ok(())
    }

    #[test]
    fn test_update_lead_patches_only_present_fields() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;

        let updated = f.db.update_lead(
            1,
            lead.id,
            UpdateLeadRequest {
                priority: Some(Priority::Urgent),
                value: Some(7500.0),
                ..Default::default()
            },
            &actor(),
        )?;
        assert_eq!(updated.priority, Priority::Urgent);
        assert_eq!(updated.value, 7500.0);
        assert_eq!(updated.title, "Acme deal");

        let entries = lead_audit_entries(&f, lead.id);
        assert_eq!(entries.len(), 1);
        let changes = &entries[0].changes;
        assert_eq!(changes.after["priority"], Value::from("urgent"));
        assert_eq!(changes.after["value"], Value::from(7500.0));
        assert!(!changes.after.contains_key("title"));
        Ok(())
    }

    #[test]
    fn test_update_lead_distinguishes_absent_from_cleared() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(
            1,
            CreateLeadRequest {
                qualification: Some(Qualification {
                    score: 80,
                    budget_confirmed: true,
                    decision_maker: true,
                    need_identified: true,
                    timeline: None,
                }),
                ..lead_request(&f)
            },
        )?;
        assert!(lead.qualification.is_some());

        // Absent: untouched.
        let updated = f.db.update_lead(
            1,
            lead.id,
            UpdateLeadRequest {
                value: Some(1.0),
                ..Default::default()
            },
            &actor(),
        )?;
        assert!(updated.qualification.is_some());

        // Present-but-null: cleared.
        let updated = f.db.update_lead(
            1,
            lead.id,
            UpdateLeadRequest {
                qualification: Some(None),
                ..Default::default()
            },
            &actor(),
        )?;
        assert!(updated.qualification.is_none());
        Ok(())
    }

    #[test]
    fn test_tag_audit_diff_survives_commas_inside_tags() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(
            1,
            CreateLeadRequest {
                tags: vec!["enterprise,emea".into()],
                ..lead_request(&f)
            },
        )?;

        // Same comma-joined rendering, different tag sets.
        let updated = f.db.update_lead(
            1,
            lead.id,
            UpdateLeadRequest {
                tags: Some(vec!["enterprise".into(), "emea".into()]),
                ..Default::default()
            },
            &actor(),
        )?;
        assert_eq!(updated.tags, vec!["enterprise", "emea"]);

        let entries = lead_audit_entries(&f, lead.id);
        assert_eq!(entries.len(), 1, "the change must be recorded");
        let changes = &entries[0].changes;
        assert_eq!(
            changes.before["tags"],
            Value::from(r#"["enterprise,emea"]"#)
        );
        assert_eq!(
            changes.after["tags"],
            Value::from(r#"["enterprise","emea"]"#)
        );
        Ok(())
    }

    #[test]
    fn test_update_lead_noop_emits_no_audit_entry() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;

        f.db.update_lead(
            1,
            lead.id,
            UpdateLeadRequest {
                value: Some(lead.value),
                ..Default::default()
            },
            &actor(),
        )?;
        assert!(lead_audit_entries(&f, lead.id).is_empty());
        Ok(())
    }

    #[test]
    fn test_move_lead_rejects_stage_from_other_board() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;
        let other = f.db.create_board(1, "Renewals", false, &actor())?;
        let foreign = f
            .db
            .create_stage(1, other.id, "Other", None, false, false, &actor())?;

        let err = f
            .db
            .move_lead_stage(1, lead.id, foreign.id, &actor())
            .unwrap_err();
        assert!(matches!(
            err,
            CrmError::InvalidStage { stage_id, .. } if stage_id == foreign.id
        ));
        Ok(())
    }

    #[test]
    fn test_move_into_closed_stage_stamps_closed_fields() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;

        let closed = f.db.move_lead_stage(1, lead.id, f.won.id, &actor())?;
        assert_eq!(closed.closed_type, Some(ClosedType::Won));
        assert!(closed.closed_at.is_some());

        let entries = lead_audit_entries(&f, lead.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Move);
        assert_eq!(entries[0].changes.before["stage_id"], Value::from(f.new.id));
        assert_eq!(entries[0].changes.after["stage_id"], Value::from(f.won.id));
        Ok(())
    }

    #[test]
    fn test_move_round_trip_restores_closed_fields() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;
        assert!(lead.closed_at.is_none() && lead.closed_type.is_none());

        f.db.move_lead_stage(1, lead.id, f.won.id, &actor())?;
        let back = f.db.move_lead_stage(1, lead.id, f.new.id, &actor())?;
        assert!(back.closed_at.is_none());
        assert!(back.closed_type.is_none());
        Ok(())
    }

    #[test]
    fn test_reentering_closed_stage_stamps_fresh_close() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(
            1,
            CreateLeadRequest {
                stage_id: Some(f.won.id),
                ..lead_request(&f)
            },
        )?;
        let first_close = lead.closed_at.clone().expect("created closed");

        f.db.move_lead_stage(1, lead.id, f.new.id, &actor())?;
        let reclosed = f.db.move_lead_stage(1, lead.id, f.won.id, &actor())?;

        // closed_at records the current close, not close history.
        assert_eq!(reclosed.closed_type, Some(ClosedType::Won));
        let second_close = reclosed.closed_at.expect("closed again");
        assert!(second_close >= first_close);
        Ok(())
    }

    #[test]
    fn test_move_to_same_stage_is_a_noop() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;
        f.db.move_lead_stage(1, lead.id, f.new.id, &actor())?;
        assert!(lead_audit_entries(&f, lead.id).is_empty());
        Ok(())
    }

    #[test]
    fn test_assign_and_unassign_lead() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;

        let assigned = f.db.assign_lead(1, lead.id, Some("user-3"), &actor())?;
        assert_eq!(assigned.assigned_to.as_deref(), Some("user-3"));

        let unassigned = f.db.assign_lead(1, lead.id, None, &actor())?;
        assert!(unassigned.assigned_to.is_none());

        let entries = lead_audit_entries(&f, lead.id);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == AuditAction::Assign));
        // Newest first: the unassign entry.
        assert_eq!(entries[0].changes.after["assigned_to"], Value::Null);
        assert_eq!(
            entries[1].changes.after["assigned_to"],
            Value::from("user-3")
        );
        Ok(())
    }

    #[test]
    fn test_delete_lead_writes_full_snapshot() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;
        f.db.delete_lead(1, lead.id, &actor())?;

        assert!(f.db.get_lead(1, lead.id)?.is_none());
        let entries = lead_audit_entries(&f, lead.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Delete);
        assert_eq!(entries[0].severity, Severity::Medium);
        assert_eq!(entries[0].changes.before["title"], Value::from("Acme deal"));
        assert_eq!(entries[0].changes.before["value"], Value::from(5000.0));
        assert!(entries[0].changes.after.is_empty());
        Ok(())
    }

    #[test]
    fn test_delete_high_value_lead_escalates_severity() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(
            1,
            CreateLeadRequest {
                value: 50_000.0,
                ..lead_request(&f)
            },
        )?;
        f.db.delete_lead(1, lead.id, &actor())?;

        let entries = lead_audit_entries(&f, lead.id);
        assert_eq!(entries[0].severity, Severity::High);
        Ok(())
    }

    #[test]
    fn test_delete_lead_blocked_by_pending_handoff() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;
        f.db.request_handoff(
            1,
            crate::handoff::HandoffRequest {
                lead_id: lead.id,
                from_member_id: "ai-1".into(),
                reason: "needs a human".into(),
                ..Default::default()
            },
            &Actor::ai("ai-1"),
        )?;

        let err = f.db.delete_lead(1, lead.id, &actor()).unwrap_err();
        assert!(matches!(
            err,
            CrmError::LeadHandoffPending { lead_id } if lead_id == lead.id
        ));
        assert!(f.db.get_lead(1, lead.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_failed_audit_write_rolls_back_the_mutation() -> Result<()> {
        let f = fixture();
        let lead = f.db.create_lead(1, lead_request(&f))?;

        // Sabotage the audit table: the move's audit insert now fails,
        // and the stage change must roll back with it.
        f.db.conn.execute_batch("DROP TABLE audit_logs")?;
        let err = f
            .db
            .move_lead_stage(1, lead.id, f.qualified.id, &actor())
            .unwrap_err();
        assert!(matches!(err, CrmError::Storage(_)));

        let unchanged = f.db.get_lead(1, lead.id)?.unwrap();
        assert_eq!(unchanged.stage_id, f.new.id, "move must not survive");
        Ok(())
    }
}
