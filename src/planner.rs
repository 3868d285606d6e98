//! Execution plan construction.
//!
//! Converts the flat feature/task collection authored in the tracking backend
//! into an ordered sequence of phases. Grouping is driven entirely by each
//! item's execution order and parallel-group label; dependency indices are
//! carried through for reporting but never influence ordering, and the
//! planner does not validate them (authoring-time responsibility).

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Literal grouping key used for items that declare no parallel group.
/// Grouping collapses on this literal key: an author-supplied group with the
/// exact same label lands in the same phase as ungrouped items.
pub const UNGROUPED_KEY: &str = "ungrouped";

/// A parallel-group label, or the ungrouped sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhaseGroup {
    Grouped(String),
    Ungrouped,
}

impl PhaseGroup {
    /// Builds a group from an optional authored label. Absent labels and the
    /// literal sentinel both normalize to `Ungrouped`.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some(l) if !l.is_empty() && l != UNGROUPED_KEY => PhaseGroup::Grouped(l.to_string()),
            _ => PhaseGroup::Ungrouped,
        }
    }

    /// The literal grouping key phases are keyed and ordered by.
    pub fn key(&self) -> &str {
        match self {
            PhaseGroup::Grouped(label) => label,
            PhaseGroup::Ungrouped => UNGROUPED_KEY,
        }
    }
}

impl Ord for PhaseGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(other.key())
    }
}

impl PartialOrd for PhaseGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for PhaseGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.key())
    }
}

impl<'de> Deserialize<'de> for PhaseGroup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("phase group key must not be empty"));
        }
        Ok(PhaseGroup::from_label(Some(&s)))
    }
}

/// Phase scheduling key: execution order first, then the literal group key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhaseKey {
    pub order: i64,
    pub group: PhaseGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Feature,
    Task,
}

/// One schedulable unit of work inside a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionItem {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub kind: ItemKind,
    pub execution_order: i64,
    pub parallelizable: bool,
    pub group: PhaseGroup,
    pub dependencies: Vec<usize>,
}

/// A group of items sharing one scheduling key, executed together before the
/// next phase begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub key: PhaseKey,
    pub items: Vec<ExecutionItem>,
}

impl Phase {
    /// A phase may dispatch its items concurrently only when every item in it
    /// declares itself parallelizable. A single sequential item forces the
    /// whole phase to run in declared order.
    pub fn parallel_eligible(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.parallelizable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub epic_id: String,
    pub phases: Vec<Phase>,
    pub total_items: usize,
}

/// Feature as authored in the tracking backend, with child tasks.
/// Missing fields default rather than erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureInput {
    pub id: String,
    pub identifier: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub execution_order: i64,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default)]
    pub dependencies: Vec<usize>,
    #[serde(default)]
    pub tasks: Vec<TaskInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub id: String,
    pub identifier: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub execution_order: i64,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

fn feature_item(feature: &FeatureInput) -> ExecutionItem {
    ExecutionItem {
        id: feature.id.clone(),
        identifier: feature.identifier.clone(),
        title: feature.title.clone(),
        kind: ItemKind::Feature,
        execution_order: feature.execution_order,
        parallelizable: feature.parallelizable,
        group: PhaseGroup::from_label(feature.parallel_group.as_deref()),
        dependencies: feature.dependencies.clone(),
    }
}

fn task_item(task: &TaskInput) -> ExecutionItem {
    ExecutionItem {
        id: task.id.clone(),
        identifier: task.identifier.clone(),
        title: task.title.clone(),
        kind: ItemKind::Task,
        execution_order: task.execution_order,
        parallelizable: task.parallelizable,
        group: PhaseGroup::from_label(task.parallel_group.as_deref()),
        dependencies: task.dependencies.clone(),
    }
}

/// Builds the execution plan for an epic.
///
/// Features and their tasks are flattened in authored order, grouped by
/// `(execution_order, group)`, and each group becomes one phase. Phases are
/// ordered ascending by key (numeric order first, then lexicographic on the
/// literal group key); items inside a phase keep their flattened order.
pub fn build_plan(epic_id: &str, features: &[FeatureInput]) -> ExecutionPlan {
    let mut items = Vec::new();
    for feature in features {
        items.push(feature_item(feature));
        for task in &feature.tasks {
            items.push(task_item(task));
        }
    }
    let total_items = items.len();

    let mut groups: BTreeMap<PhaseKey, Vec<ExecutionItem>> = BTreeMap::new();
    for item in items {
        let key = PhaseKey {
            order: item.execution_order,
            group: item.group.clone(),
        };
        groups.entry(key).or_default().push(item);
    }

    let phases = groups
        .into_iter()
        .map(|(key, items)| Phase { key, items })
        .collect();

    ExecutionPlan {
        epic_id: epic_id.to_string(),
        phases,
        total_items,
    }
}
