/*
[INPUT]:  Public API exports for opgroup-runner crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod plan;
pub mod report;

pub use plan::{PlanConfig, StepMode, StepPlan, build_operation};
pub use report::{StepOutcome, failure_lines};
