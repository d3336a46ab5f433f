//! sdui-engine - mutation and synchronization engine for server-driven UI.
//!
//! A page is a [`PageDefinition`]: an ordered tree of [`Section`]s, each
//! with a component type, free-form props and, for containers, children.
//! Producers (people or automated planners) describe changes as
//! [`AtomicAction`]s that target Sections through [`ComponentSelector`]s.
//!
//! The pieces, bottom-up:
//!
//! - [`selector`] scores Sections against a selector.
//! - [`apply`] applies one action atomically and records the [`TreeDelta`].
//! - [`governance`] checks actions against pluggable rules.
//! - [`optimistic`] applies actions locally and rolls them back by delta
//!   inversion.
//! - [`sync`] fans patches out and arbitrates conflicting writes.
//! - [`authority`] serializes actions per tree instance.
//! - [`client`] ties an optimistic local copy to the authority.
//!
//! # Example
//!
//! ```
//! use sdui_engine::{Actor, AtomicAction, ComponentSelector, Engine, GovernanceContext,
//!     MutationOp, PageDefinition, PropertyMutation, Section, Submission};
//! use serde_json::json;
//!
//! # tokio_test_main();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test_main() {
//! let engine = Engine::default();
//! let page = PageDefinition::new(vec![
//!     Section::new("chart1", "InteractiveChart").with_props(json!({"type": "line"})),
//! ]);
//! engine.open_instance("home", page, None).unwrap();
//! let mut patches = engine.subscribe("home").unwrap();
//!
//! let action = AtomicAction::MutateComponent {
//!     selector: ComponentSelector::by_description("the revenue chart"),
//!     mutations: vec![PropertyMutation::parse("props.type", MutationOp::Set, json!("bar")).unwrap()],
//! };
//! let ticket = engine
//!     .submit_action("home", Submission::new(action, GovernanceContext::new(Actor::agent("planner"))))
//!     .await
//!     .unwrap();
//! let result = ticket.confirmation.await;
//! assert!(result.success);
//! assert_eq!(result.version, 1);
//! assert_eq!(result.affected_section_ids, ["chart1"]);
//! # let _ = patches.recv().await;
//! # }
//! ```

pub mod action;
pub mod apply;
pub mod audit;
pub mod authority;
pub mod client;
pub mod config;
pub mod delta;
pub mod error;
pub mod governance;
pub mod model;
pub mod optimistic;
pub mod selector;
pub mod store;
pub mod sync;

pub use action::{AtomicAction, MutationOp, Position, PropertyMutation};
pub use apply::{apply_action, ApplyOptions, ApplyOutcome, DEFAULT_CONFIDENCE_THRESHOLD};
pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use authority::{Engine, Submission, Ticket};
pub use client::{ClientEvent, ClientSession, LocalTransport, PatchStream, Transport, TransportError};
pub use config::{EngineConfig, ReconnectPolicy};
pub use delta::{apply_delta, DeltaError, Footprint, SectionOp, Touch, TreeDelta};
pub use error::{ActionError, ActionResult, EngineError};
pub use governance::{
    Actor, ActorKind, AgentRemovalRule, BannedTermsRule, FnRule, GateDecision, GovernanceContext, GovernanceGate,
    GovernanceRule, MaxBatchSizeRule, OverrideAuthorization, ProtectedSectionsRule, Severity, Violation,
};
pub use model::{PageDefinition, Section, SectionEntry, SectionState};
pub use optimistic::{
    ExecutionId, ExecutionRecord, ExecutionStatus, NeedsResync, OptimisticApply, OptimisticExecutor,
    PendingConfirmation, Transition,
};
pub use selector::{resolve, resolve_one, ComponentSelector, MatchResult};
pub use store::{MemoryTreeStore, StoreError, TreeStore};
pub use sync::{
    ConflictOutcome, ConflictResolution, ConflictStrategy, ManualScope, Patch, Resolution, Subscription, SyncEvent,
    SyncHub, SyncMessage, Unsubscribe,
};

pub use sdui_path::{PathError, PathStep, PropertyPath};
