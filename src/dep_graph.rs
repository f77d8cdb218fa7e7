//! Dependency graph built from task `depends_on` lists
//!
//! Index-based arena: tasks are addressed by their position in the workflow's
//! declaration order, which is also the dispatch tiebreaker.

use std::collections::HashMap;

use crate::context::{ERROR_ROOT, WORKFLOW_INPUT_ROOT};
use crate::error::WeftError;
use crate::status::TaskStatus;
use crate::workflow::{Workflow, TASK_ID_RE};

/// Graph of task dependencies, validated at build time
#[derive(Debug)]
pub struct DepGraph {
    /// task index -> indices of its dependencies
    dependencies: Vec<Vec<usize>>,
    /// task index -> indices of tasks depending on it
    dependents: Vec<Vec<usize>>,
    /// task_id -> index, declaration order
    index_of: HashMap<String, usize>,
}

impl DepGraph {
    /// Build and validate the graph: id shape, duplicates, reserved roots,
    /// unknown dependencies, unknown branch targets. Cycle detection is a
    /// separate pass (`validate`).
    pub fn build(workflow: &Workflow) -> Result<Self, WeftError> {
        let count = workflow.tasks.len();
        let mut index_of: HashMap<String, usize> = HashMap::with_capacity(count);

        for (idx, task) in workflow.tasks.iter().enumerate() {
            if !TASK_ID_RE.is_match(&task.id) {
                return Err(WeftError::InvalidTaskId {
                    id: task.id.clone(),
                });
            }
            if task.id == WORKFLOW_INPUT_ROOT || task.id == ERROR_ROOT {
                return Err(WeftError::ReservedTaskId {
                    id: task.id.clone(),
                });
            }
            if index_of.insert(task.id.clone(), idx).is_some() {
                return Err(WeftError::DuplicateTaskId {
                    id: task.id.clone(),
                });
            }
        }

        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

        for (idx, task) in workflow.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let dep_idx =
                    *index_of
                        .get(dep)
                        .ok_or_else(|| WeftError::UnknownDependency {
                            task_id: task.id.clone(),
                            dependency: dep.clone(),
                        })?;
                dependencies[idx].push(dep_idx);
                dependents[dep_idx].push(idx);
            }

            for target in [task.on_success(), task.on_failure()].into_iter().flatten() {
                if !index_of.contains_key(target) {
                    return Err(WeftError::UnknownBranchTarget {
                        task_id: task.id.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            dependencies,
            dependents,
            index_of,
        })
    }

    /// Reject cycles before any task is dispatched
    ///
    /// Iterative three-color DFS; the error names one full cycle.
    pub fn validate(&self, workflow: &Workflow) -> Result<(), WeftError> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let count = self.dependencies.len();
        let mut color = vec![WHITE; count];

        for start in 0..count {
            if color[start] != WHITE {
                continue;
            }

            // (node, next dependent to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                if frame.1 < self.dependents[node].len() {
                    let child = self.dependents[node][frame.1];
                    frame.1 += 1;

                    match color[child] {
                        WHITE => {
                            color[child] = GRAY;
                            stack.push((child, 0));
                        }
                        GRAY => {
                            // Back edge: the gray suffix of the stack is the cycle
                            let from = stack
                                .iter()
                                .position(|&(n, _)| n == child)
                                .unwrap_or(0);
                            let mut ids: Vec<&str> = stack[from..]
                                .iter()
                                .map(|&(n, _)| workflow.tasks[n].id.as_str())
                                .collect();
                            ids.push(workflow.tasks[child].id.as_str());
                            return Err(WeftError::CycleDetected {
                                cycle_path: ids.join(" -> "),
                            });
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    stack.pop();
                }
            }
        }

        Ok(())
    }

    /// Tasks whose dependencies have all reached a terminal state
    ///
    /// Pure function of the status array; declaration order is preserved.
    pub fn ready_set(&self, statuses: &[TaskStatus]) -> Vec<usize> {
        statuses
            .iter()
            .enumerate()
            .filter(|&(idx, status)| {
                *status == TaskStatus::Pending
                    && self.dependencies[idx]
                        .iter()
                        .all(|&dep| statuses[dep].is_terminal())
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    #[inline]
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    #[inline]
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    #[inline]
    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index_of.get(task_id).copied()
    }
}
