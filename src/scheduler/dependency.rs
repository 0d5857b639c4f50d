//! Dependency resolution shared by DAG eligibility checks and the
//! partial-restart dependent computation.

use std::collections::{HashMap, HashSet};

use crate::model::{ExecuteMode, Step};

/// `dependsOn(step) = explicit DependsOn ∪ { producer of every input this
/// step consumes }`, matched by output name.
pub fn build_depends_on_map(steps: &[Step]) -> HashMap<String, HashSet<String>> {
    let producer_of: HashMap<&str, &str> = steps
        .iter()
        .flat_map(|s| s.outputs.iter().map(move |o| (o.name.as_str(), s.name.as_str())))
        .collect();

    let mut map: HashMap<String, HashSet<String>> = steps
        .iter()
        .map(|s| (s.name.clone(), s.depends_on.iter().cloned().collect()))
        .collect();

    for step in steps {
        for input in &step.inputs {
            if let Some(&producer) = producer_of.get(input.from.as_str())
                && producer != step.name
            {
                map.entry(step.name.clone()).or_default().insert(producer.to_string());
            }
        }
    }

    map
}

/// All predecessors (explicit + input-edge) of `name`, used for DAG
/// eligibility checks.
pub fn predecessors_of<'a>(map: &'a HashMap<String, HashSet<String>>, name: &str) -> Vec<&'a str> {
    map.get(name)
        .map(|s| s.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Transitive set of steps that (directly or indirectly) depend on
/// `target`, deduplicated with a visited set so repeated revisits through
/// a diamond dependency don't produce duplicate entries.
pub fn transitive_dependents(steps: &[Step], target: &str) -> Vec<String> {
    let map = build_depends_on_map(steps);
    let mut result: HashSet<String> = HashSet::new();
    let mut frontier: Vec<String> = vec![target.to_string()];
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(current) = frontier.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for step in steps {
            let depends_on_current = map
                .get(&step.name)
                .map(|deps| deps.contains(&current))
                .unwrap_or(false);
            if depends_on_current && result.insert(step.name.clone()) {
                frontier.push(step.name.clone());
            }
        }
    }

    result.into_iter().collect()
}

/// Non-DAG mode: every step declared after `target` in textual order.
pub fn textual_dependents(steps: &[Step], target: &str) -> Vec<String> {
    match steps.iter().position(|s| s.name == target) {
        Some(idx) => steps[idx + 1..].iter().map(|s| s.name.clone()).collect(),
        None => Vec::new(),
    }
}

/// Compute dependents of `target` in `steps`, using the mode-appropriate
/// strategy.
pub fn dependents_of(steps: &[Step], target: &str, mode: ExecuteMode) -> Vec<String> {
    match mode {
        ExecuteMode::Dag => transitive_dependents(steps, target),
        ExecuteMode::StepByStep => textual_dependents(steps, target),
    }
}
