#![allow(dead_code)]

use std::time::Duration;

use sdui_engine::{
    Actor, AtomicAction, ComponentSelector, GovernanceContext, MutationOp, PageDefinition, PropertyMutation, Section,
    Submission, SyncEvent, SyncMessage, Subscription,
};
use serde_json::{json, Value};

/// A small dashboard: header, a chart, two stat cards in a grid.
pub fn dashboard() -> PageDefinition {
    PageDefinition::new(vec![
        Section::new("header", "Header").with_props(json!({"text": "Sales overview"})),
        Section::new("chart1", "InteractiveChart").with_props(json!({
            "type": "line",
            "title": "Revenue",
            "style": {"color": "blue"}
        })),
        Section::new("grid", "Container")
            .with_layout(json!({"columns": 2}))
            .with_children(vec![
                Section::new("kpi1", "StatCard").with_props(json!({"label": "Orders", "value": 120})),
                Section::new("kpi2", "StatCard").with_props(json!({"label": "Refunds", "value": 4})),
            ]),
    ])
    .with_version(5)
}

pub fn set(id: &str, path: &str, value: Value) -> AtomicAction {
    AtomicAction::MutateComponent {
        selector: ComponentSelector::by_id(id),
        mutations: vec![PropertyMutation::parse(path, MutationOp::Set, value).unwrap()],
    }
}

pub fn human(id: &str) -> GovernanceContext {
    GovernanceContext::new(Actor::human(id))
}

pub fn submission(action: AtomicAction) -> Submission {
    Submission::new(action, human("ana"))
}

/// Next event, failing the test after a second.
pub async fn next_event(sub: &mut Subscription) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("no sync event within a second")
}

pub async fn next_patch_version(sub: &mut Subscription) -> u64 {
    match next_event(sub).await {
        SyncEvent::Message(SyncMessage::Patch(p)) => p.version,
        other => panic!("expected a patch, got {other:?}"),
    }
}
