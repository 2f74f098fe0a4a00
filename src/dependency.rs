use std::collections::{HashMap, HashSet};

use crate::types::{Feature, FeatureStatus};

/// Return the declared dependencies of `feature` that are not yet satisfied.
///
/// Pure: no I/O, cheap enough to call on every tick.
///
/// A dependency is satisfied if:
/// - The dependency id is not found in `all` (deleted or outside this view)
/// - The dependency is found with status `Verified` or `Completed`
///
/// Order follows the feature's declared dependency order.
pub fn blocking_dependencies(feature: &Feature, all: &[Feature]) -> Vec<String> {
    feature
        .dependencies
        .iter()
        .filter(|dep_id| match all.iter().find(|f| f.id == **dep_id) {
            Some(dep) => !dep.status.satisfies_dependents(),
            None => false,
        })
        .cloned()
        .collect()
}

/// A feature is ready when it sits in the backlog with nothing blocking it.
pub fn is_ready(feature: &Feature, all: &[Feature]) -> bool {
    feature.status == FeatureStatus::Backlog && blocking_dependencies(feature, all).is_empty()
}

/// Build a comma-separated summary of unmet dependencies, each as `"id (status)"`.
///
/// Returns `None` if nothing blocks the feature.
pub fn unmet_dependency_summary(feature: &Feature, all: &[Feature]) -> Option<String> {
    let unmet: Vec<String> = blocking_dependencies(feature, all)
        .into_iter()
        .filter_map(|dep_id| {
            all.iter()
                .find(|f| f.id == dep_id)
                .map(|dep| format!("{} ({})", dep_id, dep.status))
        })
        .collect();
    if unmet.is_empty() {
        None
    } else {
        Some(unmet.join(", "))
    }
}

/// Find dependency cycles among the features present in `all`.
///
/// Each cycle is reported once, as the list of ids along the cycle starting at
/// the first id encountered in store order. Dependencies on absent ids are
/// ignored, matching `blocking_dependencies`. Features caught in a cycle can
/// never become ready; nothing here tries to break the cycle.
pub fn find_dependency_cycles(all: &[Feature]) -> Vec<Vec<String>> {
    let index: HashMap<&str, &Feature> = all.iter().map(|f| (f.id.as_str(), f)).collect();

    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let mut cycles = Vec::new();
    let mut seen_cycles: HashSet<Vec<String>> = HashSet::new();

    for feature in all {
        if state.contains_key(feature.id.as_str()) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        visit(
            feature.id.as_str(),
            &index,
            &mut state,
            &mut path,
            &mut cycles,
            &mut seen_cycles,
        );
    }

    cycles
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    OnPath,
    Done,
}

fn visit<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a Feature>,
    state: &mut HashMap<&'a str, VisitState>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
    seen_cycles: &mut HashSet<Vec<String>>,
) {
    state.insert(id, VisitState::OnPath);
    path.push(id);

    if let Some(&feature) = index.get(id) {
        for dep_id in &feature.dependencies {
            let Some(&dep) = index.get(dep_id.as_str()) else {
                continue;
            };
            let dep_id: &'a str = dep.id.as_str();
            match state.get(dep_id) {
                Some(VisitState::OnPath) => {
                    if let Some(start) = path.iter().position(|p| *p == dep_id) {
                        let cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        let mut key = cycle.clone();
                        key.sort();
                        if seen_cycles.insert(key) {
                            cycles.push(cycle);
                        }
                    }
                }
                Some(VisitState::Done) => {}
                None => visit(dep_id, index, state, path, cycles, seen_cycles),
            }
        }
    }

    path.pop();
    state.insert(id, VisitState::Done);
}
