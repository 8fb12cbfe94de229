/*
[INPUT]:  YAML plan file describing steps and nested groups
[OUTPUT]: Parsed PlanConfig and the operation tree built from it
[POS]:    Configuration layer - maps plan steps onto opgroup-core operations
[UPDATE]: When adding new step kinds or plan options
*/

use anyhow::{Context, Result, bail};
use opgroup_core::{
    AsyncOperation, GroupOperation, Operation, OperationError, QueueConfig, SyncOperation,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level plan: the root queue and the steps submitted to it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanConfig {
    /// Root queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Steps submitted to the root queue
    pub steps: Vec<StepPlan>,
}

/// How a leaf step performs its simulated work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Sleeps on the worker thread that started it
    Sync,
    /// Schedules a timer and finishes from the runtime
    #[default]
    Async,
}

/// One step. A step with children is a group.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepPlan {
    pub name: String,
    #[serde(default)]
    pub mode: StepMode,
    /// Simulated work duration in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
    /// Error message the step finishes with, if any
    #[serde(default)]
    pub fail: Option<String>,
    /// Concurrency bound for a group's children
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub children: Vec<StepPlan>,
}

impl StepPlan {
    pub fn is_group(&self) -> bool {
        !self.children.is_empty()
    }
}

impl PlanConfig {
    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read plan {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let plan: Self = serde_yaml::from_str(content).context("parse plan yaml")?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reject empty plans, unnamed steps, duplicate sibling names and groups
    /// that also declare leaf behaviour.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail!("plan has no steps");
        }
        validate_siblings(&self.steps, "root")
    }

    /// Number of steps in the plan, groups included
    pub fn step_count(&self) -> usize {
        fn count(steps: &[StepPlan]) -> usize {
            steps.iter().map(|step| 1 + count(&step.children)).sum()
        }
        count(&self.steps)
    }
}

fn validate_siblings(steps: &[StepPlan], parent: &str) -> Result<()> {
    let mut names = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            bail!("step under {parent} has an empty name");
        }
        if !names.insert(step.name.as_str()) {
            bail!("duplicate step name {} under {parent}", step.name);
        }
        if step.is_group() {
            if step.fail.is_some() || step.delay_ms > 0 {
                bail!("group {} cannot set fail or delay_ms", step.name);
            }
            validate_siblings(&step.children, &step.name)?;
        } else if step.max_concurrent.is_some() {
            bail!("step {} sets max_concurrent but has no children", step.name);
        }
    }
    Ok(())
}

/// Build the operation tree for `step`.
///
/// Groups create their child queue here, so this must run inside a Tokio
/// runtime.
pub fn build_operation(step: &StepPlan) -> Arc<dyn Operation> {
    if step.is_group() {
        let config = QueueConfig {
            name: format!("{}.children", step.name),
            max_concurrent: step.max_concurrent,
        };
        let children = step.children.clone();
        return GroupOperation::from_fn_with_config(step.name.clone(), config, move |queue| {
            for child in &children {
                queue.add(build_operation(child))?;
            }
            Ok(())
        });
    }

    let delay = Duration::from_millis(step.delay_ms);
    let fail = step.fail.clone();
    match step.mode {
        StepMode::Sync => SyncOperation::from_fn(step.name.clone(), move |op| {
            std::thread::sleep(delay);
            if op.is_cancelled() {
                op.finish_cancelled();
            } else if let Some(message) = &fail {
                op.finish(Some(OperationError::msg(message.clone())));
            }
        }),
        StepMode::Async => AsyncOperation::from_fn(step.name.clone(), move |op| {
            let op = op.clone();
            let fail = fail.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                op.finish(fail.map(OperationError::msg));
            });
        }),
    }
}
