//! Handoff Coordinator: human↔AI ownership transfer state machine.
//!
//! `pending → accepted | rejected`, terminal states absorbing. The
//! `handoffs` table is the source of truth; the lead's `handoff_state`
//! projection mirrors the pending handoff and both are written in one
//! transaction. At most one pending handoff exists per lead: the check
//! runs inside the same transaction as the insert, and resolution is a
//! conditional write on `status = 'pending'` so a concurrent resolver
//! loses cleanly instead of double-applying.

use rusqlite::params;
use serde::Deserialize;

use crate::audit::{self, AuditEvent};
use crate::db::{self, CrmDb, fetch_handoff, fetch_lead, pending_handoff_id};
use crate::errors::{CrmError, Result};
use crate::models::*;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandoffRequest {
    pub lead_id: i64,
    /// Requesting actor; human or AI member id.
    pub from_member_id: String,
    /// Specific target member. Absent means "any human".
    pub to_member_id: Option<String>,
    pub reason: String,
    pub summary: Option<String>,
    pub suggested_actions: Vec<String>,
}

impl CrmDb {
    /// Open a handoff for a lead. Fails with `HandoffAlreadyPending` if
    /// the lead already has one outstanding.
    pub fn request_handoff(
        &self,
        org_id: i64,
        req: HandoffRequest,
        actor: &Actor,
    ) -> Result<Handoff> {
        if req.reason.trim().is_empty() {
            return Err(CrmError::Validation(
                "handoff reason must not be empty".into(),
            ));
        }
        if req.from_member_id.trim().is_empty() {
            return Err(CrmError::Validation(
                "handoff requester must not be empty".into(),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;

        fetch_lead(&tx, org_id, req.lead_id)?.ok_or(CrmError::NotFound {
            entity: "lead",
            id: req.lead_id,
        })?;

        // Check-then-act stays inside this transaction; two concurrent
        // requesters cannot both pass.
        if let Some(handoff_id) = pending_handoff_id(&tx, req.lead_id)? {
            tracing::warn!(
                lead_id = req.lead_id,
                handoff_id,
                "handoff request refused: one already pending"
            );
            return Err(CrmError::HandoffAlreadyPending {
                lead_id: req.lead_id,
                handoff_id,
            });
        }

        let actions_json = serde_json::to_string(&req.suggested_actions)
            .map_err(|e| anyhow::anyhow!("Failed to serialize suggested actions: {}", e))?;
        let now = db::now_rfc3339();
        tx.execute(
            "INSERT INTO handoffs (organization_id, lead_id, from_member_id, to_member_id, \
             reason, summary, suggested_actions, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                org_id,
                req.lead_id,
                req.from_member_id,
                req.to_member_id,
                req.reason,
                req.summary,
                actions_json,
                HandoffStatus::Pending.as_str(),
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let state = HandoffState {
            handoff_id: id,
            status: HandoffStatus::Pending,
            from_member_id: req.from_member_id.clone(),
            reason: req.reason.clone(),
            summary: req.summary.clone(),
            suggested_actions: req.suggested_actions.clone(),
            requested_at: now,
        };
        let state_json = serde_json::to_string(&state)
            .map_err(|e| anyhow::anyhow!("Failed to serialize handoff state: {}", e))?;
        tx.execute(
            "UPDATE leads SET handoff_state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state_json, db::now_rfc3339(), req.lead_id],
        )?;

        let mut after = FieldMap::new();
        after.insert("handoff_id".into(), id.into());
        after.insert(
            "handoff_status".into(),
            HandoffStatus::Pending.as_str().into(),
        );
        after.insert("handoff_from".into(), req.from_member_id.as_str().into());
        after.insert("handoff_to".into(), req.to_member_id.as_deref().into());
        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: req.lead_id,
                action: AuditAction::Handoff,
                before: FieldMap::new(),
                after,
                description: format!(
                    "Handoff requested by {}: {}",
                    req.from_member_id, req.reason
                ),
                severity: None,
            },
        )?;

        let handoff = fetch_handoff(&tx, org_id, id)?.ok_or(CrmError::NotFound {
            entity: "handoff",
            id,
        })?;
        tx.commit()?;

        tracing::info!(
            handoff_id = id,
            lead_id = req.lead_id,
            from = %handoff.from_member_id,
            "handoff requested"
        );
        Ok(handoff)
    }

    /// Accept a pending handoff. Acceptance implies ownership transfer:
    /// if a target member was named at request time, the lead is
    /// reassigned to them.
    pub fn accept_handoff(
        &self,
        org_id: i64,
        handoff_id: i64,
        notes: Option<&str>,
        actor: &Actor,
    ) -> Result<Handoff> {
        self.resolve_handoff(org_id, handoff_id, HandoffStatus::Accepted, notes, actor)
    }

    /// Reject a pending handoff; the lead keeps its current assignee.
    pub fn reject_handoff(
        &self,
        org_id: i64,
        handoff_id: i64,
        notes: Option<&str>,
        actor: &Actor,
    ) -> Result<Handoff> {
        self.resolve_handoff(org_id, handoff_id, HandoffStatus::Rejected, notes, actor)
    }

    fn resolve_handoff(
        &self,
        org_id: i64,
        handoff_id: i64,
        decision: HandoffStatus,
        notes: Option<&str>,
        actor: &Actor,
    ) -> Result<Handoff> {
        debug_assert!(decision.is_terminal());

        let tx = self.conn.unchecked_transaction()?;

        let handoff = fetch_handoff(&tx, org_id, handoff_id)?.ok_or(CrmError::NotFound {
            entity: "handoff",
            id: handoff_id,
        })?;

        // Conditional write: zero rows affected means another resolver
        // already moved this handoff out of `pending`.
        let updated = tx.execute(
            "UPDATE handoffs SET status = ?1, resolved_at = ?2, resolution_notes = ?3 \
             WHERE id = ?4 AND status = 'pending'",
            params![decision.as_str(), db::now_rfc3339(), notes, handoff_id],
        )?;
        if updated == 0 {
            tracing::warn!(handoff_id, status = handoff.status.as_str(), "stale handoff resolution");
            return Err(CrmError::HandoffNotPending { id: handoff_id });
        }

        tx.execute(
            "UPDATE leads SET handoff_state = NULL, updated_at = ?1 WHERE id = ?2",
            params![db::now_rfc3339(), handoff.lead_id],
        )?;

        let mut after = FieldMap::new();
        after.insert("handoff_status".into(), decision.as_str().into());
        if decision == HandoffStatus::Accepted {
            if let Some(target) = &handoff.to_member_id {
                tx.execute(
                    "UPDATE leads SET assigned_to = ?1, updated_at = ?2 WHERE id = ?3",
                    params![target, db::now_rfc3339(), handoff.lead_id],
                )?;
                after.insert("assigned_to".into(), target.as_str().into());
            }
        }

        let mut before = FieldMap::new();
        before.insert(
            "handoff_status".into(),
            HandoffStatus::Pending.as_str().into(),
        );
        let severity = match decision {
            HandoffStatus::Accepted => Some(Severity::Low),
            _ => None,
        };
        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Lead,
                entity_id: handoff.lead_id,
                action: AuditAction::Handoff,
                before,
                after,
                description: format!("Handoff {} {} by {}", handoff_id, decision.as_str(), actor.id),
                severity,
            },
        )?;

        let handoff = fetch_handoff(&tx, org_id, handoff_id)?.ok_or(CrmError::NotFound {
            entity: "handoff",
            id: handoff_id,
        })?;
        tx.commit()?;

        tracing::info!(
            handoff_id,
            lead_id = handoff.lead_id,
            decision = decision.as_str(),
            "handoff resolved"
        );
        Ok(handoff)
    }
}
