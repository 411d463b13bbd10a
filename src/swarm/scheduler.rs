//! Grouping of agents into execution groups.
//!
//! Kahn's algorithm, one layer at a time: each group holds every agent whose
//! dependencies all sit in earlier groups, sorted by id so the same input
//! always yields the same partitioning.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::errors::SwarmError;

/// Partition `agents` into dependency-ordered groups.
///
/// Dependencies naming agents outside `agents` are ignored. A cycle (including
/// an agent that depends on itself) fails the whole computation and reports
/// every agent that could not be placed.
pub fn compute_groups(
    agents: &[String],
    dependencies: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<Vec<String>>, SwarmError> {
    let mut members: HashSet<&str> = HashSet::with_capacity(agents.len());
    for agent in agents {
        if !members.insert(agent.as_str()) {
            return Err(SwarmError::DuplicateAgent(agent.clone()));
        }
    }

    // in_degree[a] = number of distinct in-set dependencies of a
    let mut in_degree: HashMap<&str, usize> = agents.iter().map(|a| (a.as_str(), 0)).collect();
    // dependents[d] = agents waiting on d
    let mut dependents: HashMap<&str, BTreeSet<&str>> = HashMap::new();

    for agent in agents {
        let Some(deps) = dependencies.get(agent) else {
            continue;
        };
        let unique: BTreeSet<&str> = deps
            .iter()
            .map(String::as_str)
            .filter(|d| members.contains(d))
            .collect();
        for dep in unique {
            if dependents.entry(dep).or_default().insert(agent.as_str())
                && let Some(degree) = in_degree.get_mut(agent.as_str())
            {
                *degree += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(agent, _)| *agent)
        .collect();
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        let group: Vec<&str> = ready.iter().copied().collect();
        let mut next: BTreeSet<&str> = BTreeSet::new();

        for agent in &group {
            in_degree.remove(agent);
            if let Some(waiting) = dependents.get(agent) {
                for dependent in waiting {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }
        }

        placed += group.len();
        groups.push(group.into_iter().map(str::to_string).collect());
        ready = next;
    }

    if placed != agents.len() {
        let mut nodes: Vec<String> = in_degree.keys().map(|a| a.to_string()).collect();
        nodes.sort();
        return Err(SwarmError::DependencyCycle { nodes });
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn deps(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(agent, on)| (agent.to_string(), ids(on)))
            .collect()
    }

    #[test]
    fn test_empty_input() {
        let groups = compute_groups(&[], &BTreeMap::new()).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_independent_agents_form_one_sorted_group() {
        let groups = compute_groups(&ids(&["z", "a", "m"]), &BTreeMap::new()).unwrap();
        assert_eq!(groups, vec![ids(&["a", "m", "z"])]);
    }

    #[test]
    fn test_diamond() {
        let groups = compute_groups(
            &ids(&["merge", "left", "right", "root"]),
            &deps(&[
                ("left", &["root"]),
                ("right", &["root"]),
                ("merge", &["left", "right"]),
            ]),
        )
        .unwrap();
        assert_eq!(
            groups,
            vec![ids(&["root"]), ids(&["left", "right"]), ids(&["merge"])]
        );
    }

    #[test]
    fn test_out_of_set_and_duplicate_dependencies_ignored() {
        let groups = compute_groups(
            &ids(&["a", "b"]),
            &deps(&[("b", &["a", "a", "ghost"]), ("ghost", &["b"])]),
        )
        .unwrap();
        assert_eq!(groups, vec![ids(&["a"]), ids(&["b"])]);
    }

    #[test]
    fn test_cycle_names_unresolved_agents() {
        let err = compute_groups(
            &ids(&["a", "b", "c", "free"]),
            &deps(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]),
        )
        .unwrap_err();
        match err {
            SwarmError::DependencyCycle { nodes } => assert_eq!(nodes, ids(&["a", "b", "c"])),
            other => panic!("Expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = compute_groups(&ids(&["a"]), &deps(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, SwarmError::DependencyCycle { .. }));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let err = compute_groups(&ids(&["a", "a"]), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SwarmError::DuplicateAgent(a) if a == "a"));
    }
}
