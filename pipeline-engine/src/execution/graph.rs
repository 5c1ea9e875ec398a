// Execution Graph (DAG) Builder
// Builds the job dependency graph from `needs` and orders it for execution

use crate::error::GraphError;
use crate::workflow::models::Workflow;

use std::collections::{BTreeSet, HashMap, VecDeque};

/// A node representing a job in the execution graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNode {
    pub id: String,
    /// Jobs this job needs
    pub needs: Vec<String>,
    /// Jobs that need this job
    pub dependents: Vec<String>,
    /// Longest path from a root; jobs on one level can run in parallel
    pub level: usize,
}

/// Acyclic job graph with a deterministic topological order.
///
/// Edges are job-level: a dependent waits on every instance of a matrix job.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: Vec<JobNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl ExecutionGraph {
    /// Build the graph for every job in a workflow
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        Self::build(
            workflow
                .jobs
                .iter()
                .map(|(id, job)| (id.as_str(), job.needs.as_slice())),
        )
    }

    /// Build from `(job, needs)` pairs in declared order
    pub fn build<'a>(
        jobs: impl IntoIterator<Item = (&'a str, &'a [String])>,
    ) -> Result<Self, GraphError> {
        let mut nodes: Vec<JobNode> = Vec::new();
        let mut index = HashMap::new();

        for (id, needs) in jobs {
            index.insert(id.to_string(), nodes.len());
            let mut unique = Vec::with_capacity(needs.len());
            for need in needs {
                if !unique.contains(need) {
                    unique.push(need.clone());
                }
            }
            nodes.push(JobNode {
                id: id.to_string(),
                needs: unique,
                dependents: Vec::new(),
                level: 0,
            });
        }

        // every need must exist
        for node in &nodes {
            for need in &node.needs {
                if !index.contains_key(need) {
                    return Err(GraphError::UnknownDependency {
                        job: node.id.clone(),
                        dependency: need.clone(),
                    });
                }
            }
        }

        for i in 0..nodes.len() {
            let id = nodes[i].id.clone();
            let needs = nodes[i].needs.clone();
            for need in needs {
                if let Some(&dep) = index.get(&need) {
                    nodes[dep].dependents.push(id.clone());
                }
            }
        }

        let mut graph = Self {
            nodes,
            index,
            order: Vec::new(),
        };
        graph.order = graph.sort()?;
        graph.assign_levels();
        Ok(graph)
    }

    /// Kahn's algorithm, seeded and drained in declared order
    fn sort(&self) -> Result<Vec<usize>, GraphError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.needs.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for dependent in &self.nodes[i].dependents {
                let Some(&d) = self.index.get(dependent) else {
                    continue;
                };
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let remaining: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|i| in_degree[*i] > 0)
            .collect();
        Err(GraphError::CycleDetected {
            cycle: self.find_cycle(&remaining),
        })
    }

    /// Name one cycle among nodes left over by the sort, as `a -> b -> a`
    fn find_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<String> {
        let Some(&start) = remaining.iter().next() else {
            return Vec::new();
        };

        // every leftover node has a leftover need, so walking needs must
        // eventually revisit a node on the current path
        let mut path: Vec<usize> = vec![start];
        loop {
            let Some(&current) = path.last() else {
                return Vec::new();
            };
            let next = self.nodes[current]
                .needs
                .iter()
                .filter_map(|n| self.index.get(n).copied())
                .find(|n| remaining.contains(n));

            let Some(next) = next else {
                return Vec::new();
            };

            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                cycle.push(self.nodes[next].id.clone());
                return cycle;
            }
            path.push(next);
        }
    }

    fn assign_levels(&mut self) {
        for &i in &self.order.clone() {
            let level = self.nodes[i]
                .needs
                .iter()
                .filter_map(|need| self.index.get(need))
                .map(|&dep| self.nodes[dep].level + 1)
                .max()
                .unwrap_or(0);
            self.nodes[i].level = level;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&JobNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in declared order
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    /// Nodes with every need ahead of its dependents
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&i| &self.nodes[i]).collect()
    }

    /// Jobs grouped by level
    pub fn levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        for node in self.topological_order() {
            if node.level >= levels.len() {
                levels.resize(node.level + 1, Vec::new());
            }
            levels[node.level].push(node);
        }
        levels
    }

    /// Every job that depends on `id`, directly or not
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node(current) {
                for dependent in &node.dependents {
                    if seen.insert(dependent.clone()) {
                        stack.push(dependent);
                    }
                }
            }
        }
        seen
    }

    /// Every job `id` waits on, directly or not
    pub fn transitive_needs(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node(current) {
                for need in &node.needs {
                    if seen.insert(need.clone()) {
                        stack.push(need);
                    }
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(jobs: &[(&str, &[&str])]) -> Result<ExecutionGraph, GraphError> {
        let owned: Vec<(String, Vec<String>)> = jobs
            .iter()
            .map(|(id, needs)| (id.to_string(), needs.iter().map(|n| n.to_string()).collect()))
            .collect();
        ExecutionGraph::build(owned.iter().map(|(id, needs)| (id.as_str(), needs.as_slice())))
    }

    #[test]
    fn test_topological_order_and_levels() {
        let g = graph(&[
            ("deploy", &["test", "lint"]),
            ("build", &[]),
            ("test", &["build"]),
            ("lint", &[]),
        ])
        .unwrap();

        let order: Vec<&str> = g.topological_order().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(order, vec!["build", "lint", "test", "deploy"]);

        let levels: Vec<Vec<&str>> = g
            .levels()
            .iter()
            .map(|l| l.iter().map(|n| n.id.as_str()).collect())
            .collect();
        assert_eq!(levels, vec![vec!["build", "lint"], vec!["test"], vec!["deploy"]]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = graph(&[("test", &["build"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                job: "test".into(),
                dependency: "build".into()
            }
        );
    }

    #[test]
    fn test_cycle_is_named() {
        let err = graph(&[
            ("setup", &[]),
            ("a", &["c", "setup"]),
            ("b", &["a"]),
            ("c", &["b"]),
        ])
        .unwrap_err();
        match err {
            GraphError::CycleDetected { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for job in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|c| c == job));
                }
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = graph(&[("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(&[
            ("y", &[]),
            ("x", &["y"]),
            ("w", &["x"]),
            ("other", &[]),
        ])
        .unwrap();
        let deps = g.transitive_dependents("y");
        assert_eq!(deps, BTreeSet::from(["x".to_string(), "w".to_string()]));
    }

    #[test]
    fn test_transitive_needs() {
        let g = graph(&[
            ("y", &[]),
            ("z", &[]),
            ("x", &["y"]),
            ("w", &["x", "z"]),
            ("other", &["w"]),
        ])
        .unwrap();
        let upstream = g.transitive_needs("w");
        assert_eq!(
            upstream,
            BTreeSet::from(["x".to_string(), "y".to_string(), "z".to_string()])
        );
        assert!(g.transitive_needs("y").is_empty());
    }
}
