//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency indexes once per run for impact
//! analysis. All traversals return ids in a stable order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use crate::project::{ProjectGraph, UnitId};

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: node -> nodes it depends on (parents)
    parents: BTreeMap<UnitId, Vec<UnitId>>,

    /// Reverse edges: node -> nodes that depend on it (children)
    children: BTreeMap<UnitId, Vec<UnitId>>,

    /// All nodes in the graph, including referenced-but-missing ids
    nodes: BTreeSet<UnitId>,
}

impl DependencyGraph {
    /// Build a dependency graph from a project graph
    pub fn from_project(graph: &ProjectGraph) -> Self {
        let mut parents: BTreeMap<UnitId, Vec<UnitId>> = BTreeMap::new();
        let mut children: BTreeMap<UnitId, Vec<UnitId>> = BTreeMap::new();
        let mut nodes: BTreeSet<UnitId> = BTreeSet::new();

        for unit in graph.units() {
            nodes.insert(unit.unique_id.clone());

            if unit.depends_on.is_empty() {
                continue;
            }

            // depends_on is a BTreeSet, so parent lists come out sorted
            parents.insert(unit.unique_id.clone(), unit.depends_on.iter().cloned().collect());

            for dep_id in &unit.depends_on {
                children
                    .entry(dep_id.clone())
                    .or_default()
                    .push(unit.unique_id.clone());

                nodes.insert(dep_id.clone());
            }
        }

        // Units are visited in id order, so child lists are already sorted
        Self {
            parents,
            children,
            nodes,
        }
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> Vec<&UnitId> {
        self.parents
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> Vec<&UnitId> {
        self.children
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get all downstream nodes (transitive closure of children), sorted
    ///
    /// This is the "blast radius" - every unit affected if this node is blocked.
    /// The node itself is never part of its own blast radius, even on a cycle.
    pub fn downstream(&self, node_id: &str) -> Vec<UnitId> {
        Self::walk(node_id, &self.children)
    }

    /// Get all upstream nodes (transitive closure of parents), sorted
    pub fn upstream(&self, node_id: &str) -> Vec<UnitId> {
        Self::walk(node_id, &self.parents)
    }

    fn walk(start: &str, edges: &BTreeMap<UnitId, Vec<UnitId>>) -> Vec<UnitId> {
        let mut visited: BTreeSet<UnitId> = BTreeSet::new();
        let mut queue = VecDeque::new();

        if let Some(next) = edges.get(start) {
            queue.extend(next.iter());
        }

        // BFS over the edge map
        while let Some(current) = queue.pop_front() {
            if current == start || !visited.insert(current.clone()) {
                continue;
            }

            if let Some(next) = edges.get(current) {
                queue.extend(next.iter().filter(|n| !visited.contains(*n)));
            }
        }

        visited.into_iter().collect()
    }

    /// Ids that are referenced as dependencies but are not units of `graph`
    /// and not registered as external
    pub fn unresolved_parents<'a>(&'a self, graph: &ProjectGraph, node_id: &str) -> Vec<&'a UnitId> {
        self.parents(node_id)
            .into_iter()
            .filter(|id| !graph.is_known(id))
            .collect()
    }

    /// Get topological sort of all nodes, or `None` if the graph has a cycle
    pub fn topological_sort(&self) -> Option<Vec<UnitId>> {
        let mut in_degree: BTreeMap<&UnitId, usize> = self.nodes
            .iter()
            .map(|node| (node, self.parents.get(node).map_or(0, Vec::len)))
            .collect();

        // Find nodes with no dependencies
        let mut queue: VecDeque<&UnitId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut result = Vec::new();

        // Kahn's algorithm
        while let Some(node) = queue.pop_front() {
            result.push(node.clone());

            // For each child, decrease in-degree
            if let Some(children) = self.children.get(node) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        // Check if all nodes were visited (no cycles)
        if result.len() == self.nodes.len() {
            Some(result)
        } else {
            None
        }
    }

    /// Every node that lies on a dependency cycle, including self-references
    ///
    /// Uses Tarjan's strongly connected components algorithm, iteratively so
    /// deep chains cannot overflow the stack.
    pub fn cycle_members(&self) -> BTreeSet<UnitId> {
        let ids: Vec<&UnitId> = self.nodes.iter().collect();
        let position: BTreeMap<&UnitId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let successors: Vec<Vec<usize>> = ids
            .iter()
            .map(|id| {
                self.parents
                    .get(*id)
                    .map(|ps| ps.iter().filter_map(|p| position.get(p).copied()).collect())
                    .unwrap_or_default()
            })
            .collect();

        let n = ids.len();
        let mut index = vec![usize::MAX; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0;
        let mut members = BTreeSet::new();

        for root in 0..n {
            if index[root] != usize::MAX {
                continue;
            }

            // (node, next successor offset)
            let mut work: Vec<(usize, usize)> = vec![(root, 0)];
            while let Some(&(v, offset)) = work.last() {
                if offset == 0 && index[v] == usize::MAX {
                    index[v] = next_index;
                    lowlink[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }

                if let Some(&w) = successors[v].get(offset) {
                    if let Some(frame) = work.last_mut() {
                        frame.1 += 1;
                    }
                    if index[w] == usize::MAX {
                        work.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }

                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }

                    let self_loop = successors[v].contains(&v);
                    if component.len() > 1 || self_loop {
                        members.extend(component.into_iter().map(|i| ids[i].clone()));
                    }
                }
            }
        }

        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ProjectUnit, UnitKind};
    use pretty_assertions::assert_eq;

    fn model(id: &str, deps: &[&str]) -> ProjectUnit {
        deps.iter()
            .fold(ProjectUnit::new(id, UnitKind::Model), |unit, dep| unit.depends_on(*dep))
    }

    fn graph(units: Vec<ProjectUnit>) -> ProjectGraph {
        ProjectGraph::build(units).graph
    }

    #[test]
    fn parents_and_children() {
        let project = graph(vec![
            model("model.p.stg_orders", &["source.p.raw.orders"]),
            model("model.p.orders", &["model.p.stg_orders"]),
        ]);
        let dag = DependencyGraph::from_project(&project);

        assert_eq!(dag.parents("model.p.orders"), vec!["model.p.stg_orders"]);
        assert_eq!(dag.children("source.p.raw.orders"), vec!["model.p.stg_orders"]);
        assert!(dag.children("model.p.orders").is_empty());
    }

    #[test]
    fn downstream_impact_is_transitive_and_sorted() {
        let project = graph(vec![
            model("model.p.python_model", &[]),
            model("model.p.z_mart", &["model.p.python_model"]),
            model("exposure.p.dashboard", &["model.p.z_mart"]),
            model("model.p.a_report", &["model.p.z_mart", "model.p.python_model"]),
            model("model.p.unrelated", &[]),
        ]);
        let dag = DependencyGraph::from_project(&project);

        assert_eq!(
            dag.downstream("model.p.python_model"),
            vec![
                "exposure.p.dashboard".to_string(),
                "model.p.a_report".to_string(),
                "model.p.z_mart".to_string(),
            ]
        );
        assert!(dag.downstream("model.p.unrelated").is_empty());
        assert_eq!(
            dag.upstream("exposure.p.dashboard"),
            vec!["model.p.python_model".to_string(), "model.p.z_mart".to_string()]
        );
    }

    #[test]
    fn downstream_excludes_start_on_cycle() {
        let project = graph(vec![
            model("model.p.a", &["model.p.b"]),
            model("model.p.b", &["model.p.a"]),
        ]);
        let dag = DependencyGraph::from_project(&project);

        assert_eq!(dag.downstream("model.p.a"), vec!["model.p.b".to_string()]);
    }

    #[test]
    fn topological_sort_orders_parents_first() {
        let project = graph(vec![
            model("model.p.c", &["model.p.b"]),
            model("model.p.b", &["model.p.a"]),
            model("model.p.a", &[]),
        ]);
        let dag = DependencyGraph::from_project(&project);

        assert_eq!(
            dag.topological_sort(),
            Some(vec!["model.p.a".to_string(), "model.p.b".to_string(), "model.p.c".to_string()])
        );
    }

    #[test]
    fn cycles_are_detected() {
        let project = graph(vec![
            model("model.p.a", &["model.p.b"]),
            model("model.p.b", &["model.p.c"]),
            model("model.p.c", &["model.p.a"]),
            model("model.p.self_ref", &["model.p.self_ref"]),
            model("model.p.tail", &["model.p.a"]),
        ]);
        let dag = DependencyGraph::from_project(&project);

        assert!(dag.topological_sort().is_none());

        let members: Vec<String> = dag.cycle_members().into_iter().collect();
        assert_eq!(
            members,
            vec!["model.p.a", "model.p.b", "model.p.c", "model.p.self_ref"]
        );
    }

    #[test]
    fn acyclic_graph_has_no_cycle_members() {
        let project = graph(vec![
            model("model.p.a", &[]),
            model("model.p.b", &["model.p.a"]),
        ]);
        assert!(DependencyGraph::from_project(&project).cycle_members().is_empty());
    }

    #[test]
    fn unresolved_parents_ignore_external_ids() {
        let mut project = graph(vec![model(
            "model.p.orders",
            &["source.p.raw.orders", "model.p.ghost"],
        )]);
        project.add_external("source.p.raw.orders");
        let dag = DependencyGraph::from_project(&project);

        assert_eq!(dag.unresolved_parents(&project, "model.p.orders"), vec!["model.p.ghost"]);
    }
}
