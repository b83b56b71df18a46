//! Differ - Compare desired state with current state
//!
//! Compares the "desired state" declared in configuration with the "current
//! state" fetched from the Provider, and reports which attributes changed and
//! whether any change forces a replacement.

use std::collections::{BTreeSet, HashMap};

use crate::resource::{Resource, ResourceId, State, Value};
use crate::schema::ResourceSchema;

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Resource does not exist -> needs creation
    Create(Resource),
    /// Resource exists with differences -> needs update
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource exists with no differences -> no action needed
    NoChange(ResourceId),
    /// Resource exists but not in desired state -> needs deletion
    Delete(ResourceId),
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange(_))
    }
}

/// Set of changed attribute names, with a subset flagged as forcing replacement
///
/// Attributes marked force-new cannot be changed in place; the resource has to
/// be destroyed and recreated when one of them differs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changed: BTreeSet<String>,
    force_new: BTreeSet<String>,
}

impl ChangeSet {
    /// Compute the changed attributes between two attribute maps
    pub fn between(old: &HashMap<String, Value>, new: &HashMap<String, Value>) -> Self {
        Self {
            changed: find_changed_attributes(new, old).into_iter().collect(),
            force_new: BTreeSet::new(),
        }
    }

    pub fn has_change(&self, key: &str) -> bool {
        self.changed.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn changed(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().map(String::as_str)
    }

    /// Record that a changed attribute cannot be updated in place
    pub fn mark_force_new(&mut self, key: impl Into<String>) {
        self.force_new.insert(key.into());
    }

    /// Flag every changed attribute the schema declares force-new
    pub fn with_schema_force_new(mut self, schema: &ResourceSchema) -> Self {
        for key in schema.force_new_keys() {
            if self.changed.contains(key) {
                self.force_new.insert(key.to_string());
            }
        }
        self
    }

    pub fn force_new_attributes(&self) -> impl Iterator<Item = &str> {
        self.force_new.iter().map(String::as_str)
    }

    pub fn requires_replacement(&self) -> bool {
        !self.force_new.is_empty()
    }
}

/// Compare desired state with current state to compute a Diff
pub fn diff(desired: &Resource, current: &State) -> Diff {
    if !current.exists {
        return Diff::Create(desired.clone());
    }

    let changed = find_changed_attributes(&desired.attributes, &current.attributes);

    if changed.is_empty() {
        Diff::NoChange(desired.id.clone())
    } else {
        Diff::Update {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    }
}

/// Find changed attributes between desired and current state
fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
) -> Vec<String> {
    let mut changed = Vec::new();

    for (key, desired_value) in desired {
        // Skip internal attributes (starting with _)
        if key.starts_with('_') {
            continue;
        }

        match current.get(key) {
            Some(current_value) if current_value == desired_value => {}
            _ => changed.push(key.clone()),
        }
    }

    changed
}

/// Compute Diffs for multiple resources, skipping those with no changes
pub fn plan(desired: &[Resource], current_states: &HashMap<ResourceId, State>) -> Vec<Diff> {
    let mut diffs = Vec::new();

    for resource in desired {
        let current = current_states
            .get(&resource.id)
            .cloned()
            .unwrap_or_else(|| State::not_found(resource.id.clone()));

        let d = diff(resource, &current);
        if d.is_change() {
            diffs.push(d);
        }
    }

    diffs
}
