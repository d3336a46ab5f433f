mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{dashboard, human, next_event, next_patch_version, set, submission};
use sdui_engine::{
    ActionError, AtomicAction, AuditEvent, BannedTermsRule, ComponentSelector, ConflictResolution, ConflictStrategy,
    Engine, EngineConfig, EngineError, GovernanceGate, ManualScope, MemoryAuditSink, Position, ProtectedSectionsRule,
    Resolution, Section, SyncEvent, SyncMessage,
};
use serde_json::json;

fn conflict(event: SyncEvent) -> Arc<sdui_engine::ConflictOutcome> {
    match event {
        SyncEvent::Message(SyncMessage::Conflict(outcome)) => outcome,
        other => panic!("expected a conflict outcome, got {other:?}"),
    }
}

// ── Applying ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn mutate_bumps_version_and_publishes_one_patch() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let ticket = engine
        .submit_action("home", submission(set("chart1", "props.type", json!("bar"))))
        .await
        .unwrap();
    let result = ticket.confirmation.await;

    assert!(result.success);
    assert_eq!(result.version, 6);
    assert_eq!(result.affected_section_ids, ["chart1"]);
    match next_event(&mut sub).await {
        SyncEvent::Message(SyncMessage::Patch(patch)) => {
            assert_eq!(patch.version, 6);
            assert_eq!(patch.execution_id, Some(ticket.execution_id));
            assert_eq!(patch.affected_section_ids, ["chart1"]);
            assert_eq!(patch.tree.section("chart1").unwrap().props["type"], json!("bar"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sub.try_recv(), None);
    assert_eq!(engine.snapshot("home").unwrap().version, 6);
    assert_eq!(engine.watch("home").unwrap().borrow().version, 6);
}

#[tokio::test]
async fn non_permutation_reorder_is_malformed_and_silent() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let reorder = AtomicAction::ReorderComponents {
        parent_id: Some("grid".into()),
        order: vec!["kpi1".into(), "kpi1".into()],
    };
    let result = engine.submit_action("home", submission(reorder)).await.unwrap().confirmation.await;

    assert!(!result.success);
    assert_eq!(result.version, 5);
    assert!(matches!(result.error, Some(ActionError::MalformedAction { .. })));
    assert_eq!(sub.try_recv(), None);
    assert_eq!(*engine.snapshot("home").unwrap(), dashboard());
}

#[tokio::test]
async fn missing_anchor_is_not_found_and_silent() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let add = AtomicAction::AddComponent {
        section: Section::new("note", "TextBlock"),
        position: Position::AfterId("ghost".into()),
        parent_id: None,
    };
    let result = engine.submit_action("home", submission(add)).await.unwrap().confirmation.await;

    assert!(matches!(
        result.error,
        Some(ActionError::SelectorNotFound { ref selector }) if selector.contains("ghost")
    ));
    assert_eq!(sub.try_recv(), None);
    assert!(!engine.snapshot("home").unwrap().contains_id("note"));
}

#[tokio::test]
async fn failing_batch_names_the_step_and_changes_nothing() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();

    let batch = AtomicAction::Batch {
        actions: vec![
            set("header", "text", json!("Changed")),
            AtomicAction::RemoveComponent {
                selector: ComponentSelector::by_id("ghost"),
            },
        ],
    };
    let result = engine.submit_action("home", submission(batch)).await.unwrap().confirmation.await;

    assert_eq!(result.failed_step, Some(1));
    assert_eq!(
        engine.snapshot("home").unwrap().section("header").unwrap().props["text"],
        json!("Sales overview")
    );
}

// ── Conflicts ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn last_write_wins_reports_the_earlier_loser() {
    let audit = MemoryAuditSink::new();
    let engine = Engine::default().with_audit(Arc::new(audit.clone()));
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let first = engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("bar"))).with_base_version(5).with_origin("a"),
        )
        .await
        .unwrap();
    assert!(first.confirmation.await.success);
    let second = engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("pie"))).with_base_version(5).with_origin("b"),
        )
        .await
        .unwrap();
    let second_id = second.execution_id;
    assert_eq!(second.confirmation.await.version, 7);

    assert_eq!(next_patch_version(&mut sub).await, 6);
    assert_eq!(next_patch_version(&mut sub).await, 7);
    let outcome = conflict(next_event(&mut sub).await);
    assert_eq!(outcome.strategy, ConflictStrategy::LastWriteWins);
    assert_eq!(outcome.winners, [second_id]);
    assert_eq!(outcome.losers, [first.execution_id]);
    assert_eq!(outcome.section_ids, ["chart1"]);
    assert_eq!(
        engine.snapshot("home").unwrap().section("chart1").unwrap().props["type"],
        json!("pie")
    );

    let audited: Vec<_> = audit
        .events()
        .into_iter()
        .filter_map(|e| match e {
            AuditEvent::Conflict {
                execution_id,
                version,
                outcome,
                ..
            } => Some((execution_id, version, outcome.conflict_id)),
            _ => None,
        })
        .collect();
    assert_eq!(audited, [(second_id, 7, outcome.conflict_id.clone())]);
}

#[tokio::test]
async fn last_write_wins_leaves_disjoint_paths_alone() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    for (origin, path, value) in [("a", "title", json!("Quarterly")), ("b", "type", json!("bar"))] {
        let ticket = engine
            .submit_action(
                "home",
                submission(set("chart1", path, value)).with_base_version(5).with_origin(origin),
            )
            .await
            .unwrap();
        assert!(ticket.confirmation.await.success);
    }

    assert_eq!(next_patch_version(&mut sub).await, 6);
    assert_eq!(next_patch_version(&mut sub).await, 7);
    // Nobody lost anything, so nobody is told to roll back.
    assert!(sub.try_recv().is_none());

    let tree = engine.snapshot("home").unwrap();
    let chart = tree.section("chart1").unwrap();
    assert_eq!(chart.props["title"], json!("Quarterly"));
    assert_eq!(chart.props["type"], json!("bar"));
}

#[tokio::test]
async fn first_write_wins_rejects_the_later_action() {
    let engine = Engine::default();
    engine
        .open_instance("home", dashboard(), Some(ConflictStrategy::FirstWriteWins))
        .unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let first = engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("bar"))).with_base_version(5).with_origin("a"),
        )
        .await
        .unwrap();
    first.confirmation.await;
    let second = engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("pie"))).with_base_version(5).with_origin("b"),
        )
        .await
        .unwrap();
    let second_id = second.execution_id;
    let result = second.confirmation.await;

    assert!(matches!(
        result.error,
        Some(ActionError::VersionConflict { base: 5, current: 6, .. })
    ));
    assert_eq!(next_patch_version(&mut sub).await, 6);
    let outcome = conflict(next_event(&mut sub).await);
    assert_eq!(outcome.resolution, ConflictResolution::FirstWriteWins);
    assert_eq!(outcome.winners, [first.execution_id]);
    assert_eq!(outcome.losers, [second_id]);
    assert_eq!(engine.snapshot("home").unwrap().version, 6);
}

#[tokio::test]
async fn merge_keeps_disjoint_paths_and_falls_back_on_overlap() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), Some(ConflictStrategy::Merge)).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    for (origin, path, value) in [("a", "type", json!("bar")), ("b", "title", json!("Sales"))] {
        let ticket = engine
            .submit_action(
                "home",
                submission(set("chart1", path, value)).with_base_version(5).with_origin(origin),
            )
            .await
            .unwrap();
        assert!(ticket.confirmation.await.success);
    }
    let tree = engine.snapshot("home").unwrap();
    let chart = tree.section("chart1").unwrap();
    assert_eq!(chart.props["type"], json!("bar"));
    assert_eq!(chart.props["title"], json!("Sales"));

    next_patch_version(&mut sub).await;
    next_patch_version(&mut sub).await;
    let merged = conflict(next_event(&mut sub).await);
    assert_eq!(merged.resolution, ConflictResolution::Merged);
    assert!(merged.losers.is_empty());
    assert_eq!(merged.winners.len(), 2);

    // Same path from the same stale base: last write wins.
    let ticket = engine
        .submit_action(
            "home",
            submission(set("chart1", "style.color", json!("red"))).with_base_version(5).with_origin("c"),
        )
        .await
        .unwrap();
    ticket.confirmation.await;
    let ticket = engine
        .submit_action(
            "home",
            submission(set("chart1", "style", json!({"color": "green"})))
                .with_base_version(7)
                .with_origin("d"),
        )
        .await
        .unwrap();
    assert!(ticket.confirmation.await.success);
    next_patch_version(&mut sub).await;
    // The third action itself raced both earlier ones.
    let _ = conflict(next_event(&mut sub).await);
    next_patch_version(&mut sub).await;
    let fallback = conflict(next_event(&mut sub).await);
    assert_eq!(fallback.resolution, ConflictResolution::LastWriteWins);
    assert_eq!(fallback.losers.len(), 1);
}

#[tokio::test]
async fn same_origin_never_conflicts() {
    let engine = Engine::default();
    engine
        .open_instance("home", dashboard(), Some(ConflictStrategy::FirstWriteWins))
        .unwrap();
    for value in ["bar", "pie"] {
        let ticket = engine
            .submit_action(
                "home",
                submission(set("chart1", "type", json!(value))).with_base_version(5).with_origin("a"),
            )
            .await
            .unwrap();
        assert!(ticket.confirmation.await.success);
    }
}

#[tokio::test]
async fn manual_conflict_blocks_the_section_until_resolved() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), Some(ConflictStrategy::Manual)).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let first = engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("bar"))).with_base_version(5).with_origin("a"),
        )
        .await
        .unwrap();
    first.confirmation.await;
    let held = engine
        .submit_action(
            "home",
            submission(set("chart1", "title", json!("Sales"))).with_base_version(5).with_origin("b"),
        )
        .await
        .unwrap();
    let held_id = held.execution_id;

    next_patch_version(&mut sub).await;
    let pending = conflict(next_event(&mut sub).await);
    assert_eq!(pending.resolution, ConflictResolution::Pending);
    assert_eq!(engine.pending_conflicts("home").await.unwrap(), [(*pending).clone()]);

    // The held section refuses writes; others still apply.
    let blocked = engine
        .submit_action("home", submission(set("chart1", "type", json!("pie"))))
        .await
        .unwrap()
        .confirmation
        .await;
    assert!(matches!(
        blocked.error,
        Some(ActionError::VersionConflict { ref reason, .. }) if reason.contains("chart1")
    ));
    let other = engine
        .submit_action("home", submission(set("kpi1", "value", json!(121))))
        .await
        .unwrap()
        .confirmation
        .await;
    assert!(other.success);
    next_patch_version(&mut sub).await;

    let resolved = engine
        .resolve_conflict("home", &pending.conflict_id, Resolution::AcceptIncoming)
        .await
        .unwrap();
    assert_eq!(resolved.resolution, ConflictResolution::AcceptedIncoming);
    assert_eq!(resolved.winners, [held_id]);
    assert_eq!(resolved.losers, [first.execution_id]);

    let result = held.confirmation.await;
    assert!(result.success);
    assert_eq!(result.version, 8);
    assert_eq!(
        engine.snapshot("home").unwrap().section("chart1").unwrap().props["title"],
        json!("Sales")
    );
    assert!(engine.pending_conflicts("home").await.unwrap().is_empty());
    assert!(matches!(
        engine
            .resolve_conflict("home", &pending.conflict_id, Resolution::KeepExisting)
            .await,
        Err(EngineError::UnknownConflict(_))
    ));
}

#[tokio::test]
async fn manual_instance_scope_blocks_everything() {
    let config = EngineConfig {
        conflict_strategy: ConflictStrategy::Manual,
        manual_scope: ManualScope::Instance,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);
    engine.open_instance("home", dashboard(), None).unwrap();

    engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("bar"))).with_base_version(5).with_origin("a"),
        )
        .await
        .unwrap()
        .confirmation
        .await;
    let held = engine
        .submit_action(
            "home",
            submission(set("chart1", "type", json!("pie"))).with_base_version(5).with_origin("b"),
        )
        .await
        .unwrap();

    let elsewhere = engine
        .submit_action("home", submission(set("kpi2", "value", json!(0))))
        .await
        .unwrap()
        .confirmation
        .await;
    assert!(matches!(elsewhere.error, Some(ActionError::VersionConflict { .. })));

    let conflict_id = engine.pending_conflicts("home").await.unwrap()[0].conflict_id.clone();
    let outcome = engine
        .resolve_conflict("home", &conflict_id, Resolution::KeepExisting)
        .await
        .unwrap();
    assert_eq!(outcome.resolution, ConflictResolution::KeptExisting);
    assert!(matches!(
        held.confirmation.await.error,
        Some(ActionError::VersionConflict { .. })
    ));
    assert_eq!(
        engine.snapshot("home").unwrap().section("chart1").unwrap().props["type"],
        json!("bar")
    );
}

// ── Governance ────────────────────────────────────────────────────────────

#[tokio::test]
async fn governance_blocks_synchronously_and_override_is_audited() {
    let audit = MemoryAuditSink::new();
    let engine = Engine::default()
        .with_gate(GovernanceGate::new().with_rule(ProtectedSectionsRule::new(["header"])))
        .with_audit(Arc::new(audit.clone()));
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();

    let remove = AtomicAction::RemoveComponent {
        selector: ComponentSelector::by_id("header"),
    };
    let err = engine
        .submit_action("home", submission(remove.clone()))
        .await
        .unwrap_err();
    match err {
        EngineError::Action(ActionError::GovernanceBlocked { violations }) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].rule_id, "protected_sections");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sub.try_recv(), None);

    let elevated = human("lead").with_override("lead", "rebrand");
    let ticket = engine
        .submit_action("home", sdui_engine::Submission::new(remove, elevated))
        .await
        .unwrap();
    assert_eq!(ticket.override_applied.as_ref().unwrap().authorized_by, "lead");
    assert!(ticket.confirmation.await.success);
    assert!(!engine.snapshot("home").unwrap().contains_id("header"));

    let events = audit.events();
    assert!(events.iter().any(|e| matches!(e, AuditEvent::Override { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, AuditEvent::Violation { blocked: true, .. })));
    assert!(events.iter().any(|e| matches!(e, AuditEvent::Applied { .. })));
}

#[tokio::test]
async fn warnings_do_not_block() {
    let engine = Engine::default().with_gate(GovernanceGate::new().with_rule(BannedTermsRule::default()));
    engine.open_instance("home", dashboard(), None).unwrap();

    let ticket = engine
        .submit_action("home", submission(set("header", "text", json!("Guaranteed growth"))))
        .await
        .unwrap();
    assert_eq!(ticket.warnings.len(), 1);
    assert!(ticket.confirmation.await.success);
}

// ── Delivery ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn lagging_subscriber_is_forced_to_resync() {
    let engine = Engine::new(EngineConfig {
        subscriber_capacity: 2,
        ..EngineConfig::default()
    });
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut slow = engine.subscribe("home").unwrap();

    for n in 0..5 {
        engine
            .submit_action("home", submission(set("kpi1", "value", json!(n))))
            .await
            .unwrap()
            .confirmation
            .await;
    }
    assert_eq!(next_event(&mut slow).await, SyncEvent::ResyncRequired { missed: 3 });
    assert_eq!(next_patch_version(&mut slow).await, 9);
    assert_eq!(next_patch_version(&mut slow).await, 10);
}

#[tokio::test]
async fn unsubscribed_listener_stops_receiving() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = engine
        .subscribe_listener("home", move |event| {
            if let SyncEvent::Message(SyncMessage::Patch(patch)) = event {
                sink.lock().unwrap().push(patch.version);
            }
        })
        .unwrap();

    engine
        .submit_action("home", submission(set("kpi1", "value", json!(1))))
        .await
        .unwrap()
        .confirmation
        .await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener never saw the first patch");
    assert!(listener.is_active());

    listener.unsubscribe();
    engine
        .submit_action("home", submission(set("kpi1", "value", json!(2))))
        .await
        .unwrap()
        .confirmation
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock().unwrap(), [6]);
    assert_eq!(engine.snapshot("home").unwrap().version, 7);
    assert!(matches!(
        engine.subscribe_listener("away", |_| {}),
        Err(EngineError::UnknownInstance(_))
    ));
}

#[tokio::test]
async fn closing_an_instance_closes_subscribers() {
    let engine = Engine::default();
    engine.open_instance("home", dashboard(), None).unwrap();
    let mut sub = engine.subscribe("home").unwrap();
    engine.close_instance("home").await.unwrap();

    assert_eq!(next_event(&mut sub).await, SyncEvent::Closed);
    assert!(matches!(engine.snapshot("home"), Err(EngineError::UnknownInstance(_))));
    assert!(engine.instance_ids().is_empty());
}
