use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;

use super::notebook_validation_job::NotebookValidationJob;

pub const LABEL_JOB_ID: &str = "mlops.mlops.dev/job-id";
pub const LABEL_COMPONENT: &str = "mlops.mlops.dev/component";
pub const LABEL_OWNER: &str = "mlops.mlops.dev/owner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Build,
    Validation,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Build => "build",
            Component::Validation => "validation",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of every child resource, derivable from the job alone.
///
/// Strategies and the execution orchestrator re-locate their resources through
/// these labels only, so nothing has to survive a controller restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLabels {
    pub namespace: String,
    pub job_id: String,
    pub owner: String,
}

impl JobLabels {
    pub fn for_job(job: &NotebookValidationJob) -> Self {
        let owner = job.name_any();
        JobLabels {
            namespace: job.namespace().unwrap_or_default(),
            job_id: job.uid().unwrap_or_else(|| owner.clone()),
            owner,
        }
    }

    /// Labels stamped on a resource of the given component.
    pub fn labels(&self, component: Component) -> BTreeMap<String, String> {
        let mut labels = self.job_selector();
        labels.insert(LABEL_COMPONENT.to_string(), component.as_str().to_string());
        labels
    }

    pub fn selector(&self, component: Component) -> BTreeMap<String, String> {
        self.labels(component)
    }

    /// Matches every child regardless of component. Used for cleanup.
    pub fn job_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_JOB_ID.to_string(), self.job_id.clone()),
            (LABEL_OWNER.to_string(), self.owner.clone()),
        ])
    }
}

pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
