/*
[INPUT]:  Finished top-level operations
[OUTPUT]: Per-step outcomes and indented failure trees for logging
[POS]:    Reporting layer - turns operation errors into readable lines
[UPDATE]: When changing how failures are summarised
*/

use opgroup_core::{Operation, OperationError, operation_error};

/// Final state of one top-level step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub name: String,
    pub finished: bool,
    pub error: Option<OperationError>,
}

impl StepOutcome {
    pub fn of(op: &dyn Operation) -> Self {
        Self {
            name: op.name().to_string(),
            finished: op.is_finished(),
            error: operation_error(op),
        }
    }

    pub fn is_success(&self) -> bool {
        self.finished && self.error.is_none()
    }
}

/// Flatten an error into lines, one per leaf failure, indented by nesting depth
pub fn failure_lines(err: &OperationError) -> Vec<String> {
    let mut lines = Vec::new();
    collect(err, 0, &mut lines);
    lines
}

fn collect(err: &OperationError, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    match err.as_aggregate() {
        Some(aggregate) => {
            let count = aggregate.len();
            lines.push(format!("{indent}{count} failed"));
            for inner in aggregate {
                collect(inner, depth + 1, lines);
            }
        }
        None => lines.push(format!("{indent}{err}")),
    }
}
