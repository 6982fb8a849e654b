pub mod conditions;
pub mod labels;
pub mod notebook_validation_job;
pub(crate) mod validation_pod;

/// Field manager recorded on every object the controller writes.
pub(crate) const MANAGER_NAME: &str = "notebook-validator";

/// Keeps a job around until its labeled children are gone.
pub(crate) const JOB_FINALIZER: &str = "mlops.mlops.dev/finalizer";
