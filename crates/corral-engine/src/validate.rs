use crate::document::WorkflowDocument;
use std::collections::{HashMap, HashSet};

/// Whether forward references (a dependency on a task declared later in
/// the list) are rejected outright or tolerated as long as the graph
/// stays acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    #[default]
    Strict,
    Relaxed,
}

/// Pure validation; the same document always yields the same errors in
/// the same order. An empty vector means the workflow may execute.
pub fn validate(doc: &WorkflowDocument, mode: ValidationMode) -> Vec<String> {
    let mut errors = Vec::new();

    if doc.name.trim().is_empty() {
        errors.push("Workflow name is required".to_string());
    }
    if doc.tasks.is_empty() {
        errors.push("Workflow has no tasks".to_string());
    }

    let mut seen = HashSet::new();
    for task in &doc.tasks {
        if task.id.trim().is_empty() {
            errors.push("Task with empty ID".to_string());
            continue;
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("Duplicate task ID: {}", task.id));
        }
        if task.kind.trim().is_empty() {
            errors.push(format!("Task {} has no type", task.id));
        }
        if task.description.trim().is_empty() {
            errors.push(format!("Task {} has no description", task.id));
        }
    }

    let positions: HashMap<&str, usize> = doc
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    for task in &doc.tasks {
        for dep in &task.depends {
            if !positions.contains_key(dep.as_str()) {
                errors.push(format!("Task {} depends on unknown task {dep}", task.id));
            }
        }
    }

    if has_cycle(doc, &positions) {
        errors.push("Circular dependencies detected".to_string());
    } else if mode == ValidationMode::Strict {
        for (index, task) in doc.tasks.iter().enumerate() {
            for dep in &task.depends {
                if let Some(&dep_index) = positions.get(dep.as_str()) {
                    if dep_index >= index {
                        errors.push(format!(
                            "Task {} has forward dependency on {dep}",
                            task.id
                        ));
                    }
                }
            }
        }
    }

    let declared: HashSet<&str> = doc.agents.iter().map(|a| a.id.as_str()).collect();
    for task in &doc.tasks {
        if let Some(target) = &task.assign_to {
            if !declared.contains(target.as_str()) {
                errors.push(format!(
                    "Task {} is assigned to undeclared agent {target}",
                    task.id
                ));
            }
        }
    }

    errors
}

/// Iterative DFS with an explicit recursion set; no call-stack recursion.
fn has_cycle(doc: &WorkflowDocument, positions: &HashMap<&str, usize>) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let n = doc.tasks.len();
    let mut marks = vec![Mark::Unvisited; n];

    for start in 0..n {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // (node, next dependency edge to explore)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;

        while let Some(top) = stack.len().checked_sub(1) {
            let (node, edge) = stack[top];
            let deps = &doc.tasks[node].depends;
            if edge >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            stack[top].1 += 1;
            let Some(&next) = positions.get(deps[edge].as_str()) else {
                continue; // unknown deps are reported separately
            };
            match marks[next] {
                Mark::InProgress => return true,
                Mark::Unvisited => {
                    marks[next] = Mark::InProgress;
                    stack.push((next, 0));
                }
                Mark::Done => {}
            }
        }
    }
    false
}
