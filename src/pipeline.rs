//! Pipeline Model: boards and their ordered stages.
//!
//! Stages are totally ordered by `position` within a board; each board
//! carries at most one closed-won and one closed-lost stage, and an
//! organization keeps at most one default board.

use rusqlite::params;

use crate::audit::{self, AuditEvent};
use crate::db::{self, CrmDb, STAGE_COLUMNS, fetch_board, fetch_stage, map_board, map_stage};
use crate::errors::{CrmError, Result};
use crate::models::*;

fn stage_snapshot(stage: &Stage) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("board_id".into(), stage.board_id.into());
    fields.insert("name".into(), stage.name.as_str().into());
    fields.insert("position".into(), i64::from(stage.position).into());
    fields.insert("is_closed_won".into(), stage.is_closed_won.into());
    fields.insert("is_closed_lost".into(), stage.is_closed_lost.into());
    fields
}

impl CrmDb {
    // ── Boards ────────────────────────────────────────────────────────

    pub fn create_board(
        &self,
        org_id: i64,
        name: &str,
        is_default: bool,
        actor: &Actor,
    ) -> Result<Board> {
        if name.trim().is_empty() {
            return Err(CrmError::Validation("board name must not be empty".into()));
        }

        let tx = self.conn.unchecked_transaction()?;

        // A new default demotes the previous one in the same transaction.
        if is_default {
            tx.execute(
                "UPDATE boards SET is_default = 0 WHERE organization_id = ?1 AND is_default = 1",
                params![org_id],
            )?;
        }

        let display_order: i32 = tx.query_row(
            "SELECT COALESCE(MAX(display_order), -1) + 1 FROM boards WHERE organization_id = ?1",
            params![org_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO boards (organization_id, name, is_default, display_order, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![org_id, name, is_default, display_order, db::now_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();

        let mut after = FieldMap::new();
        after.insert("name".into(), name.into());
        after.insert("is_default".into(), is_default.into());
        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Board,
                entity_id: id,
                action: AuditAction::Create,
                before: FieldMap::new(),
                after,
                description: format!("Board '{}' created", name),
                severity: None,
            },
        )?;

        let board = fetch_board(&tx, org_id, id)?.ok_or(CrmError::NotFound {
            entity: "board",
            id,
        })?;
        tx.commit()?;

        tracing::info!(board_id = id, org_id, "board created");
        Ok(board)
    }

    pub fn list_boards_with_stages(&self, org_id: i64) -> Result<Vec<BoardWithStages>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, organization_id, name, is_default, display_order, created_at \
             FROM boards WHERE organization_id = ?1 ORDER BY display_order, id",
        )?;
        let rows = stmt.query_map(params![org_id], map_board)?;
        let mut boards = Vec::new();
        for row in rows {
            boards.push(row?);
        }

        let mut out = Vec::with_capacity(boards.len());
        for board in boards {
            let stages = self.list_stages(org_id, board.id)?;
            out.push(BoardWithStages { board, stages });
        }
        Ok(out)
    }

    pub fn list_stages(&self, org_id: i64, board_id: i64) -> Result<Vec<Stage>> {
        let sql = format!(
            "SELECT {} FROM stages WHERE board_id = ?1 AND organization_id = ?2 \
             ORDER BY position, id",
            STAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![board_id, org_id], map_stage)?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row?);
        }
        Ok(stages)
    }

    // ── Stages ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_stage(
        &self,
        org_id: i64,
        board_id: i64,
        name: &str,
        position: Option<i32>,
        is_closed_won: bool,
        is_closed_lost: bool,
        actor: &Actor,
    ) -> Result<Stage> {
        if name.trim().is_empty() {
            return Err(CrmError::Validation("stage name must not be empty".into()));
        }
        if is_closed_won && is_closed_lost {
            return Err(CrmError::Validation(
                "a stage cannot be both closed-won and closed-lost".into(),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;

        fetch_board(&tx, org_id, board_id)?.ok_or(CrmError::NotFound {
            entity: "board",
            id: board_id,
        })?;

        if is_closed_won {
            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM stages WHERE board_id = ?1 AND is_closed_won = 1",
                params![board_id],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Err(CrmError::Validation(format!(
                    "board {} already has a closed-won stage",
                    board_id
                )));
            }
        }
        if is_closed_lost {
            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM stages WHERE board_id = ?1 AND is_closed_lost = 1",
                params![board_id],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Err(CrmError::Validation(format!(
                    "board {} already has a closed-lost stage",
                    board_id
                )));
            }
        }

        let position = match position {
            Some(p) => {
                let taken: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM stages WHERE board_id = ?1 AND position = ?2",
                    params![board_id, p],
                    |row| row.get(0),
                )?;
                if taken > 0 {
                    return Err(CrmError::Validation(format!(
                        "position {} is already taken on board {}",
                        p, board_id
                    )));
                }
                p
            }
            None => tx.query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM stages WHERE board_id = ?1",
                params![board_id],
                |row| row.get(0),
            )?,
        };

        tx.execute(
            "INSERT INTO stages (organization_id, board_id, name, position, is_closed_won, \
             is_closed_lost, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                org_id,
                board_id,
                name,
                position,
                is_closed_won,
                is_closed_lost,
                db::now_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();

        let stage = fetch_stage(&tx, org_id, id)?.ok_or(CrmError::NotFound {
            entity: "stage",
            id,
        })?;

        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Stage,
                entity_id: id,
                action: AuditAction::Create,
                before: FieldMap::new(),
                after: stage_snapshot(&stage),
                description: format!("Stage '{}' created on board {}", name, board_id),
                severity: None,
            },
        )?;

        tx.commit()?;
        tracing::info!(stage_id = id, board_id, "stage created");
        Ok(stage)
    }

    /// Reassign stage positions on a board. Every referenced stage must
    /// belong to the board, and the resulting position set across the
    /// whole board must be free of ties.
    pub fn reorder_stages(
        &self,
        org_id: i64,
        board_id: i64,
        orders: &[(i64, i32)],
        actor: &Actor,
    ) -> Result<Vec<Stage>> {
        let tx = self.conn.unchecked_transaction()?;

        let board = fetch_board(&tx, org_id, board_id)?.ok_or(CrmError::NotFound {
            entity: "board",
            id: board_id,
        })?;

        let sql = format!(
            "SELECT {} FROM stages WHERE board_id = ?1 AND organization_id = ?2 \
             ORDER BY position, id",
            STAGE_COLUMNS
        );
        let mut current: Vec<Stage> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![board_id, org_id], map_stage)?;
            let mut stages = Vec::new();
            for row in rows {
                stages.push(row?);
            }
            stages
        };

        let before: FieldMap = current
            .iter()
            .map(|s| (format!("stage_{}", s.id), i64::from(s.position).into()))
            .collect();

        for (stage_id, position) in orders {
            let stage = current
                .iter_mut()
                .find(|s| s.id == *stage_id)
                .ok_or(CrmError::InvalidStage {
                    stage_id: *stage_id,
                    board_id,
                })?;
            stage.position = *position;
        }

        let mut seen = std::collections::BTreeSet::new();
        for stage in &current {
            if !seen.insert(stage.position) {
                return Err(CrmError::Validation(format!(
                    "duplicate stage position {} on board {}",
                    stage.position, board_id
                )));
            }
        }

        for (stage_id, position) in orders {
            tx.execute(
                "UPDATE stages SET position = ?1 WHERE id = ?2",
                params![position, stage_id],
            )?;
        }

        let after: FieldMap = current
            .iter()
            .map(|s| (format!("stage_{}", s.id), i64::from(s.position).into()))
            .collect();
        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Board,
                entity_id: board_id,
                action: AuditAction::Update,
                before,
                after,
                description: format!("Stages reordered on board '{}'", board.name),
                severity: None,
            },
        )?;

        tx.commit()?;
        tracing::info!(board_id, moved = orders.len(), "stages reordered");

        current.sort_by_key(|s| s.position);
        Ok(current)
    }

    pub fn delete_stage(&self, org_id: i64, stage_id: i64, actor: &Actor) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let stage = fetch_stage(&tx, org_id, stage_id)?.ok_or(CrmError::NotFound {
            entity: "stage",
            id: stage_id,
        })?;

        let lead_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM leads WHERE stage_id = ?1 AND organization_id = ?2",
            params![stage_id, org_id],
            |row| row.get(0),
        )?;
        if lead_count > 0 {
            return Err(CrmError::StageInUse {
                stage_id,
                lead_count,
            });
        }

        let sibling_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM stages WHERE board_id = ?1",
            params![stage.board_id],
            |row| row.get(0),
        )?;
        if sibling_count <= 1 {
            return Err(CrmError::Validation(format!(
                "board {} must retain at least one stage",
                stage.board_id
            )));
        }

        tx.execute("DELETE FROM stages WHERE id = ?1", params![stage_id])?;

        audit::record(
            &tx,
            org_id,
            actor,
            AuditEvent {
                entity_type: EntityType::Stage,
                entity_id: stage_id,
                action: AuditAction::Delete,
                before: stage_snapshot(&stage),
                after: FieldMap::new(),
                description: format!("Stage '{}' deleted", stage.name),
                severity: None,
            },
        )?;

        tx.commit()?;
        tracing::info!(stage_id, board_id = stage.board_id, "stage deleted");
        Ok(())
    }
}
