//! Conflict detection and arbitration.
//!
//! The authority keeps a bounded [`ConflictWindow`] of recently applied
//! actions. An incoming action based on version `b` conflicts with every
//! window entry applied after `b` by a different origin whose footprint
//! overlaps its own. [`arbitrate`] then decides what happens under the
//! instance's [`ConflictStrategy`].

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::delta::Footprint;
use crate::error::ActionError;
use crate::optimistic::ExecutionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    FirstWriteWins,
    Merge,
    Manual,
}

/// What a pending manual conflict blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualScope {
    /// Only the Sections the conflicting actions touched.
    #[default]
    Section,
    /// The whole tree instance.
    Instance,
}

/// A human decision on a held manual conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Apply the held action on top of the current tree.
    AcceptIncoming,
    /// Discard the held action.
    KeepExisting,
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LastWriteWins,
    FirstWriteWins,
    /// Disjoint paths; both actions stand.
    Merged,
    /// Held for a manual decision.
    Pending,
    AcceptedIncoming,
    KeptExisting,
}

/// Published for every detected conflict so losing clients can roll back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictOutcome {
    pub conflict_id: String,
    pub tree_instance_id: String,
    pub strategy: ConflictStrategy,
    pub resolution: ConflictResolution,
    pub winners: Vec<ExecutionId>,
    pub losers: Vec<ExecutionId>,
    pub section_ids: Vec<String>,
    /// Tree version after the resolution took effect.
    pub version: u64,
}

/// One action the authority applied.
#[derive(Debug, Clone)]
pub struct AppliedEntry {
    pub version: u64,
    pub base_version: u64,
    pub execution_id: ExecutionId,
    pub origin: Option<String>,
    pub footprint: Footprint,
}

#[derive(Debug, Clone)]
pub struct ConflictWindow {
    capacity: usize,
    entries: VecDeque<AppliedEntry>,
}

impl ConflictWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, entry: AppliedEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries applied after `base_version` by someone other than `origin`.
    ///
    /// Fails with `VersionConflict` when the window no longer covers every
    /// version after `base_version`, since overlap can no longer be checked.
    pub fn concurrent(
        &self,
        base_version: u64,
        current_version: u64,
        origin: Option<&str>,
    ) -> Result<Vec<&AppliedEntry>, ActionError> {
        if base_version >= current_version {
            return Ok(Vec::new());
        }
        let covered = self.entries.front().is_some_and(|e| e.version <= base_version + 1);
        if !covered {
            return Err(ActionError::VersionConflict {
                base: base_version,
                current: current_version,
                reason: "base version is older than the conflict window".into(),
            });
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| e.version > base_version)
            .filter(|e| origin.is_none() || e.origin.as_deref() != origin)
            .collect())
    }
}

/// What to do with an incoming action that raced earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No overlap with anything concurrent.
    Clear,
    /// Apply it. `losers` are earlier executions it overrides.
    Apply {
        resolution: ConflictResolution,
        winners: Vec<ExecutionId>,
        losers: Vec<ExecutionId>,
        section_ids: Vec<String>,
    },
    /// Reject it in favour of `winners`.
    Reject {
        winners: Vec<ExecutionId>,
        section_ids: Vec<String>,
    },
    /// Hold it for a manual decision.
    Hold {
        existing: Vec<ExecutionId>,
        section_ids: Vec<String>,
    },
}

/// Decide what happens to an action whose footprint is `incoming`, given the
/// entries applied concurrently with it.
///
/// Last/first write wins only fire when some pair of writes can touch the
/// same state, so a loser's change is always overwritten by the winner.
/// Merge and manual look at whole Sections.
pub fn arbitrate(strategy: ConflictStrategy, incoming: &Footprint, concurrent: &[&AppliedEntry]) -> Verdict {
    let overlapping: Vec<&AppliedEntry> = concurrent
        .iter()
        .copied()
        .filter(|e| match strategy {
            ConflictStrategy::LastWriteWins | ConflictStrategy::FirstWriteWins => {
                e.footprint.overlaps_paths(incoming)
            }
            ConflictStrategy::Merge | ConflictStrategy::Manual => e.footprint.overlaps_sections(incoming),
        })
        .collect();
    if overlapping.is_empty() {
        return Verdict::Clear;
    }

    let existing: Vec<ExecutionId> = overlapping.iter().map(|e| e.execution_id).collect();
    let mine = incoming.section_ids();
    let section_ids: Vec<String> = overlapping
        .iter()
        .flat_map(|e| e.footprint.section_ids())
        .filter(|id| mine.contains(id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    match strategy {
        ConflictStrategy::LastWriteWins => Verdict::Apply {
            resolution: ConflictResolution::LastWriteWins,
            winners: Vec::new(),
            losers: existing,
            section_ids,
        },
        ConflictStrategy::FirstWriteWins => Verdict::Reject {
            winners: existing,
            section_ids,
        },
        ConflictStrategy::Merge => {
            if overlapping.iter().any(|e| e.footprint.overlaps_paths(incoming)) {
                Verdict::Apply {
                    resolution: ConflictResolution::LastWriteWins,
                    winners: Vec::new(),
                    losers: existing,
                    section_ids,
                }
            } else {
                Verdict::Apply {
                    resolution: ConflictResolution::Merged,
                    winners: existing,
                    losers: Vec::new(),
                    section_ids,
                }
            }
        }
        ConflictStrategy::Manual => Verdict::Hold { existing, section_ids },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Touch;
    use sdui_path::PropertyPath;

    fn prop(id: &str, path: &str) -> Footprint {
        let mut f = Footprint::default();
        f.touch(Touch::Property {
            id: id.into(),
            path: PropertyPath::parse(path).unwrap(),
        });
        f
    }

    fn entry(version: u64, origin: &str, footprint: Footprint) -> AppliedEntry {
        AppliedEntry {
            version,
            base_version: version - 1,
            execution_id: ExecutionId::new(),
            origin: Some(origin.into()),
            footprint,
        }
    }

    #[test]
    fn window_filters_by_version_and_origin() {
        let mut window = ConflictWindow::new(3);
        for v in 1..=4 {
            window.record(entry(v, if v % 2 == 0 { "a" } else { "b" }, prop("x", "title")));
        }
        assert_eq!(window.len(), 3);

        let seen = window.concurrent(2, 4, Some("a")).unwrap();
        assert_eq!(seen.iter().map(|e| e.version).collect::<Vec<_>>(), [3]);
        assert!(window.concurrent(4, 4, Some("a")).unwrap().is_empty());
        assert!(matches!(
            window.concurrent(0, 4, Some("a")),
            Err(ActionError::VersionConflict { base: 0, current: 4, .. })
        ));
    }

    #[test]
    fn strategies() {
        let earlier = entry(6, "a", prop("chart1", "type"));
        let concurrent = [&earlier];
        let same_path = prop("chart1", "type");
        let other_path = prop("chart1", "title");
        let other_section = prop("chart2", "type");

        assert_eq!(
            arbitrate(ConflictStrategy::LastWriteWins, &other_section, &concurrent),
            Verdict::Clear
        );
        assert_eq!(
            arbitrate(ConflictStrategy::LastWriteWins, &other_path, &concurrent),
            Verdict::Clear
        );
        assert_eq!(
            arbitrate(ConflictStrategy::FirstWriteWins, &other_path, &concurrent),
            Verdict::Clear
        );
        assert!(matches!(
            arbitrate(ConflictStrategy::LastWriteWins, &same_path, &concurrent),
            Verdict::Apply { ref losers, ref section_ids, .. } if losers == &[earlier.execution_id] && section_ids == &["chart1"]
        ));
        assert!(matches!(
            arbitrate(ConflictStrategy::FirstWriteWins, &same_path, &concurrent),
            Verdict::Reject { ref winners, .. } if winners == &[earlier.execution_id]
        ));
        assert!(matches!(
            arbitrate(ConflictStrategy::Merge, &other_path, &concurrent),
            Verdict::Apply { resolution: ConflictResolution::Merged, ref losers, .. } if losers.is_empty()
        ));
        assert!(matches!(
            arbitrate(ConflictStrategy::Merge, &same_path, &concurrent),
            Verdict::Apply { resolution: ConflictResolution::LastWriteWins, .. }
        ));
        assert!(matches!(
            arbitrate(ConflictStrategy::Manual, &other_path, &concurrent),
            Verdict::Hold { .. }
        ));
    }

    #[test]
    fn strategy_names() {
        assert_eq!(
            serde_json::to_string(&ConflictStrategy::LastWriteWins).unwrap(),
            "\"last_write_wins\""
        );
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriteWins);
        assert_eq!(ManualScope::default(), ManualScope::Section);
    }
}
