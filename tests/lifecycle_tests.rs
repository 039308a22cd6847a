//! End-to-end lifecycle tests.
//!
//! These drive the public API the way an embedding application would:
//! build a pipeline, run a lead through a handoff and a close, and check
//! the audit trail afterwards.

use std::sync::Once;

use funnel::{
    Actor, AuditAction, AuditLogFilter, ClosedType, CreateLeadRequest, CrmDb, CrmError, DbHandle,
    EntityType, HandoffRequest, HandoffStatus, Result, Severity,
};

static TRACING: Once = Once::new();

/// Route tracing output through the test harness; `RUST_LOG` controls
/// verbosity.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn human() -> Actor {
    Actor::human("user-7")
}

fn ai() -> Actor {
    Actor::ai("ai-1")
}

/// Board with New / Qualified / Won stages, Won marked closed-won.
fn setup_pipeline(db: &CrmDb, org_id: i64) -> Result<(i64, i64, i64, i64)> {
    let board = db.create_board(org_id, "Sales", true, &human())?;
    let new = db.create_stage(org_id, board.id, "New", None, false, false, &human())?;
    let qualified =
        db.create_stage(org_id, board.id, "Qualified", None, false, false, &human())?;
    let won = db.create_stage(org_id, board.id, "Won", None, true, false, &human())?;
    Ok((board.id, new.id, qualified.id, won.id))
}

#[test]
fn test_lead_lifecycle_with_handoff_and_close() -> Result<()> {
    init_tracing();
    let db = CrmDb::new_in_memory()?;
    let (board_id, new_id, qualified_id, won_id) = setup_pipeline(&db, 1)?;

    let lead = db.create_lead(
        1,
        CreateLeadRequest {
            title: "Acme expansion".into(),
            contact_id: "contact-1".into(),
            board_id,
            value: 25_000.0,
            ..Default::default()
        },
    )?;
    assert_eq!(lead.stage_id, new_id, "lead lands in the first stage");

    db.move_lead_stage(1, lead.id, qualified_id, &ai())?;

    // AI hands the lead to a human; a second request must be refused.
    let handoff = db.request_handoff(
        1,
        HandoffRequest {
            lead_id: lead.id,
            from_member_id: "ai-1".into(),
            to_member_id: Some("user-7".into()),
            reason: "price negotiation beyond my authority".into(),
            ..Default::default()
        },
        &ai(),
    )?;
    let err = db
        .request_handoff(
            1,
            HandoffRequest {
                lead_id: lead.id,
                from_member_id: "ai-2".into(),
                reason: "duplicate".into(),
                ..Default::default()
            },
            &Actor::ai("ai-2"),
        )
        .unwrap_err();
    assert!(matches!(err, CrmError::HandoffAlreadyPending { .. }));

    let accepted = db.accept_handoff(1, handoff.id, Some("on it"), &human())?;
    assert_eq!(accepted.status, HandoffStatus::Accepted);
    let lead_after = db.get_lead(1, lead.id)?.unwrap();
    assert!(lead_after.handoff_state.is_none());
    assert_eq!(lead_after.assigned_to.as_deref(), Some("user-7"));

    // Human closes the deal.
    let closed = db.move_lead_stage(1, lead.id, won_id, &human())?;
    assert_eq!(closed.closed_type, Some(ClosedType::Won));
    assert!(closed.closed_at.is_some());

    // Exactly three entries for this lead, newest first:
    // the close move, the acceptance, the request.
    let entries = db
        .list_audit_logs(
            1,
            AuditLogFilter {
                entity_type: Some(EntityType::Lead),
                entity_id: Some(lead.id),
                ..Default::default()
            },
            None,
            50,
        )?
        .items;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].action, AuditAction::Move);
    assert_eq!(entries[0].actor_id, "user-7");
    assert_eq!(entries[1].action, AuditAction::Handoff);
    assert_eq!(entries[1].severity, Severity::Low);
    assert_eq!(entries[2].action, AuditAction::Handoff);
    assert_eq!(entries[2].severity, Severity::Medium);
    assert_eq!(entries[2].actor_id, "ai-1");
    Ok(())
}

#[test]
fn test_delete_blocked_until_handoff_resolves() -> Result<()> {
    init_tracing();
    let db = CrmDb::new_in_memory()?;
    let (board_id, ..) = setup_pipeline(&db, 1)?;
    let lead = db.create_lead(
        1,
        CreateLeadRequest {
            title: "Stalled deal".into(),
            contact_id: "contact-2".into(),
            board_id,
            value: 50_000.0,
            ..Default::default()
        },
    )?;
    let handoff = db.request_handoff(
        1,
        HandoffRequest {
            lead_id: lead.id,
            from_member_id: "ai-1".into(),
            reason: "customer unresponsive".into(),
            ..Default::default()
        },
        &ai(),
    )?;

    let err = db.delete_lead(1, lead.id, &human()).unwrap_err();
    assert!(matches!(err, CrmError::LeadHandoffPending { .. }));

    db.reject_handoff(1, handoff.id, Some("let it go"), &human())?;
    db.delete_lead(1, lead.id, &human())?;
    assert!(db.get_lead(1, lead.id)?.is_none());

    // High-value delete escalates; handoff history survives the lead.
    let entries = db
        .list_audit_logs(
            1,
            AuditLogFilter {
                action: Some(AuditAction::Delete),
                ..Default::default()
            },
            None,
            10,
        )?
        .items;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].severity, Severity::High);
    assert_eq!(db.get_handoff(1, handoff.id)?.unwrap().lead_id, lead.id);
    Ok(())
}

#[test]
fn test_organizations_are_isolated_end_to_end() -> Result<()> {
    init_tracing();
    let db = CrmDb::new_in_memory()?;
    let (board_a, ..) = setup_pipeline(&db, 1)?;
    setup_pipeline(&db, 2)?;

    let lead = db.create_lead(
        1,
        CreateLeadRequest {
            title: "Org 1 deal".into(),
            contact_id: "contact-1".into(),
            board_id: board_a,
            ..Default::default()
        },
    )?;

    assert!(db.get_lead(2, lead.id)?.is_none());
    assert!(
        db.list_leads(2, Default::default(), None, 10)?
            .items
            .is_empty()
    );
    let err = db
        .move_lead_stage(2, lead.id, 1, &human())
        .unwrap_err();
    assert!(matches!(err, CrmError::NotFound { entity: "lead", .. }));
    Ok(())
}

#[test]
fn test_state_survives_reopen() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().map_err(|e| CrmError::Other(e.into()))?;
    let path = dir.path().join("crm.db");

    let lead_id = {
        let db = CrmDb::new(&path)?;
        let (board_id, ..) = setup_pipeline(&db, 1)?;
        let lead = db.create_lead(
            1,
            CreateLeadRequest {
                title: "Durable deal".into(),
                contact_id: "contact-1".into(),
                board_id,
                ..Default::default()
            },
        )?;
        db.request_handoff(
            1,
            HandoffRequest {
                lead_id: lead.id,
                from_member_id: "ai-1".into(),
                reason: "needs human review".into(),
                ..Default::default()
            },
            &ai(),
        )?;
        lead.id
    };

    let db = CrmDb::new(&path)?;
    let lead = db.get_lead(1, lead_id)?.expect("lead should persist");
    let state = lead.handoff_state.expect("projection should persist");
    assert_eq!(state.status, HandoffStatus::Pending);
    assert_eq!(db.list_boards_with_stages(1)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_async_handle_round_trip() -> Result<()> {
    init_tracing();
    let handle = DbHandle::new(CrmDb::new_in_memory()?);

    let (board_id, lead_id) = handle
        .call(|db| {
            let board = db.create_board(1, "Sales", true, &Actor::human("user-7"))?;
            db.create_stage(1, board.id, "New", None, false, false, &Actor::human("user-7"))?;
            let lead = db.create_lead(
                1,
                CreateLeadRequest {
                    title: "Async deal".into(),
                    contact_id: "contact-1".into(),
                    board_id: board.id,
                    ..Default::default()
                },
            )?;
            Ok((board.id, lead.id))
        })
        .await?;

    let page = handle
        .call(move |db| {
            db.list_leads(
                1,
                funnel::LeadFilter {
                    board_id: Some(board_id),
                    ..Default::default()
                },
                None,
                10,
            )
        })
        .await?;
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, lead_id);
    Ok(())
}
