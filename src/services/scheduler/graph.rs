//! Task Dependency Graph
//!
//! Arena of nodes addressed by integer index. Edges are index lists, so the
//! graph holds no references between nodes and cycle detection walks indices.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use crate::utils::error::{AppError, AppResult};

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    ids: Vec<i64>,
    index: HashMap<i64, usize>,
    /// `dependencies[i]`: nodes that node `i` depends on
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]`: nodes that depend on node `i`
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl TaskGraph {
    /// Build and validate a graph from `(task_id, dependency_ids)` pairs.
    ///
    /// Rejects duplicate ids, self-dependencies and unknown dependencies with
    /// a validation error, and any cycle with a dependency-cycle error naming
    /// the cycle path.
    pub fn build<I, D>(nodes: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (i64, D)>,
        D: IntoIterator<Item = i64>,
    {
        let mut raw: Vec<(i64, Vec<i64>)> = nodes
            .into_iter()
            .map(|(id, deps)| (id, deps.into_iter().collect()))
            .collect();
        raw.sort_by_key(|(id, _)| *id);

        let mut graph = TaskGraph {
            ids: Vec::with_capacity(raw.len()),
            index: HashMap::with_capacity(raw.len()),
            dependencies: vec![Vec::new(); raw.len()],
            dependents: vec![Vec::new(); raw.len()],
        };
        for (i, (id, _)) in raw.iter().enumerate() {
            if graph.index.insert(*id, i).is_some() {
                return Err(AppError::validation(format!("Duplicate task id {}", id)));
            }
            graph.ids.push(*id);
        }

        for (i, (id, deps)) in raw.iter().enumerate() {
            for dep in deps {
                if dep == id {
                    return Err(AppError::validation(format!(
                        "Task {} cannot depend on itself",
                        id
                    )));
                }
                let Some(&j) = graph.index.get(dep) else {
                    return Err(AppError::validation(format!(
                        "Task {} depends on unknown task {}",
                        id, dep
                    )));
                };
                if !graph.dependencies[i].contains(&j) {
                    graph.dependencies[i].push(j);
                    graph.dependents[j].push(i);
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<String> = cycle.iter().map(|i| graph.ids[*i].to_string()).collect();
            return Err(AppError::DependencyCycle(path.join(" → ")));
        }

        Ok(graph)
    }

    /// Depth-first search over indices; returns the first cycle found as a
    /// closed path (first node repeated at the end).
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        let mut path: Vec<usize> = Vec::new();

        for root in 0..self.ids.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // (node, index of the next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;
            path.push(root);

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if let Some(&dep) = self.dependencies[node].get(next) {
                    frame.1 += 1;
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::OnStack;
                            path.push(dep);
                            stack.push((dep, 0));
                        }
                        Mark::OnStack => {
                            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                            let mut cycle = path[start..].to_vec();
                            cycle.push(dep);
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, task_id: i64) -> bool {
        self.index.contains_key(&task_id)
    }

    pub fn dependencies_of(&self, task_id: i64) -> Vec<i64> {
        self.neighbours(task_id, &self.dependencies)
    }

    pub fn dependents_of(&self, task_id: i64) -> Vec<i64> {
        self.neighbours(task_id, &self.dependents)
    }

    fn neighbours(&self, task_id: i64, edges: &[Vec<usize>]) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .index
            .get(&task_id)
            .map(|i| edges[*i].iter().map(|j| self.ids[*j]).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Every task that depends on `task_id`, directly or transitively, ascending
    pub fn transitive_dependents(&self, task_id: i64) -> Vec<i64> {
        let Some(&start) = self.index.get(&task_id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.ids.len()];
        let mut queue = VecDeque::from([start]);
        let mut result = Vec::new();
        while let Some(node) = queue.pop_front() {
            for &dependent in &self.dependents[node] {
                if !seen[dependent] {
                    seen[dependent] = true;
                    result.push(self.ids[dependent]);
                    queue.push_back(dependent);
                }
            }
        }
        result.sort_unstable();
        result
    }

    /// Kahn's algorithm; among tasks whose dependencies are placed, the lowest
    /// id goes first.
    pub fn topological_order(&self) -> Vec<i64> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut heap: BinaryHeap<Reverse<(i64, usize)>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse((self.ids[i], i)))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(Reverse((id, node))) = heap.pop() {
            order.push(id);
            for &dependent in &self.dependents[node] {
                in_degree[dependent] = in_degree[dependent].saturating_sub(1);
                if in_degree[dependent] == 0 {
                    heap.push(Reverse((self.ids[dependent], dependent)));
                }
            }
        }
        order
    }

    /// Length of the longest dependency chain below `task_id` (0 for roots)
    pub fn dependency_depth(&self, task_id: i64) -> Option<usize> {
        let target = *self.index.get(&task_id)?;
        let mut depth = vec![0usize; self.ids.len()];
        for id in self.topological_order() {
            let node = self.index[&id];
            depth[node] = self.dependencies[node]
                .iter()
                .map(|dep| depth[*dep] + 1)
                .max()
                .unwrap_or(0);
            if node == target {
                break;
            }
        }
        Some(depth[target])
    }

    /// Whether making `task_id` depend on `dependency_id` would close a cycle
    pub fn would_create_cycle(&self, task_id: i64, dependency_id: i64) -> bool {
        if task_id == dependency_id {
            return true;
        }
        let (Some(&task), Some(&dep)) = (self.index.get(&task_id), self.index.get(&dependency_id))
        else {
            return false;
        };
        // A cycle appears iff `dependency_id` already (transitively) depends on `task_id`
        let mut seen = vec![false; self.ids.len()];
        let mut stack = vec![dep];
        while let Some(node) = stack.pop() {
            if node == task {
                return true;
            }
            for &next in &self.dependencies[node] {
                if !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(i64, &[i64])]) -> AppResult<TaskGraph> {
        TaskGraph::build(edges.iter().map(|(id, deps)| (*id, deps.to_vec())))
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = graph(&[(1, &[3]), (2, &[1]), (3, &[2])]).unwrap_err();
        match err {
            AppError::DependencyCycle(path) => {
                assert_eq!(path, "1 → 3 → 2 → 1");
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_and_unknown_dependencies_are_validation_errors() {
        assert!(matches!(
            graph(&[(1, &[1])]).unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            graph(&[(1, &[42])]).unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            graph(&[(1, &[]), (1, &[])]).unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        // 1 <- 2 <- 3, 1 <- 4, 5 independent
        let g = graph(&[(1, &[]), (2, &[1]), (3, &[2]), (4, &[1]), (5, &[])]).unwrap();
        assert_eq!(g.transitive_dependents(1), vec![2, 3, 4]);
        assert_eq!(g.transitive_dependents(2), vec![3]);
        assert!(g.transitive_dependents(5).is_empty());
        assert_eq!(g.dependents_of(1), vec![2, 4]);
        assert_eq!(g.dependencies_of(3), vec![2]);
    }

    #[test]
    fn test_topological_order_and_depth() {
        let g = graph(&[(3, &[1, 2]), (1, &[]), (2, &[1]), (4, &[])]).unwrap();
        assert_eq!(g.topological_order(), vec![1, 2, 3, 4]);
        assert_eq!(g.dependency_depth(1), Some(0));
        assert_eq!(g.dependency_depth(3), Some(2));
        assert_eq!(g.dependency_depth(99), None);
    }

    #[test]
    fn test_would_create_cycle() {
        let g = graph(&[(1, &[]), (2, &[1]), (3, &[2])]).unwrap();
        assert!(g.would_create_cycle(1, 3));
        assert!(g.would_create_cycle(2, 2));
        assert!(!g.would_create_cycle(3, 1));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let g = graph(&[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2, 3])]).unwrap();
        assert_eq!(g.len(), 4);
        assert_eq!(g.transitive_dependents(1), vec![2, 3, 4]);
    }
}
