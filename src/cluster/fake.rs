//! In-memory cluster used by unit tests. Stores objects keyed by kind, namespace and name,
//! and records every mutation so tests can assert on side effects.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};

use super::{Capability, Cluster, ClusterError};
use crate::kubernetes_objects::notebook_validation_job::{
    JobPhase, NotebookValidationJob, NotebookValidationJobStatus,
};

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    capabilities: BTreeSet<Capability>,
    jobs: BTreeMap<(String, String), NotebookValidationJob>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    logs: HashMap<String, String>,
    created: Vec<(String, String)>,
    deleted: Vec<(String, String)>,
    status_writes: usize,
    phase_history: Vec<JobPhase>,
    fail_next_list: Option<ClusterError>,
    fail_next_discover: Option<ClusterError>,
    fail_next_finalizer: Option<ClusterError>,
    uid_counter: u64,
}

/// Equality based selector match, the only kind this controller issues.
fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_capabilities(self, capabilities: &[Capability]) -> Self {
        self.state().capabilities.extend(capabilities.iter().copied());
        self
    }

    pub fn insert_job(&self, mut job: NotebookValidationJob) {
        let mut state = self.state();
        state.uid_counter += 1;
        if job.metadata.uid.is_none() {
            job.metadata.uid = Some(format!("uid-{}", state.uid_counter));
        }
        if job.metadata.generation.is_none() {
            job.metadata.generation = Some(1);
        }
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        state.jobs.insert(key, job);
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<NotebookValidationJob> {
        self.state()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn status(&self, namespace: &str, name: &str) -> NotebookValidationJobStatus {
        self.job(namespace, name)
            .and_then(|j| j.status)
            .unwrap_or_default()
    }

    /// Simulates `kubectl delete`: the finalizer keeps the object around.
    pub fn mark_job_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        if let Some(job) = state
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            job.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Default::default()),
            );
        }
    }

    pub fn bump_generation(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        if let Some(job) = state
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            job.metadata.generation = Some(job.metadata.generation.unwrap_or(1) + 1);
        }
    }

    pub fn objects(&self, kind: &str) -> Vec<DynamicObject> {
        self.state()
            .objects
            .iter()
            .filter(|((k, _, _), _)| k == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.state()
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Replaces the `status` of a stored object, standing in for the backend controller.
    pub fn set_object_status(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) {
        let mut state = self.state();
        if let Some(object) =
            state
                .objects
                .get_mut(&(kind.to_string(), namespace.to_string(), name.to_string()))
            && let Some(data) = object.data.as_object_mut()
        {
            data.insert("status".to_string(), status);
        }
    }

    pub fn set_logs(&self, pod: &str, logs: &str) {
        self.state().logs.insert(pod.to_string(), logs.to_string());
    }

    pub fn fail_next_list(&self, error: ClusterError) {
        self.state().fail_next_list = Some(error);
    }

    pub fn fail_next_discover(&self, error: ClusterError) {
        self.state().fail_next_discover = Some(error);
    }

    pub fn fail_next_finalizer(&self, error: ClusterError) {
        self.state().fail_next_finalizer = Some(error);
    }

    /// Names of objects of this kind created so far, deleted ones included.
    pub fn created(&self, kind: &str) -> Vec<String> {
        self.state()
            .created
            .iter()
            .filter(|(k, _)| k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn deleted(&self, kind: &str) -> Vec<String> {
        self.state()
            .deleted
            .iter()
            .filter(|(k, _)| k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    pub fn phase_history(&self) -> Vec<JobPhase> {
        self.state().phase_history.clone()
    }

    pub fn total_objects(&self) -> usize {
        self.state().objects.len()
    }
}

impl Cluster for FakeCluster {
    async fn discover(&self, capability: &Capability) -> Result<bool, ClusterError> {
        let mut state = self.state();
        if let Some(error) = state.fail_next_discover.take() {
            return Err(error);
        }
        Ok(state.capabilities.contains(capability))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let mut state = self.state();
        if let Some(error) = state.fail_next_list.take() {
            return Err(error);
        }
        Ok(state
            .objects
            .iter()
            .filter(|((kind, ns, _), object)| {
                kind == &resource.kind
                    && ns == namespace
                    && selector_matches(selector, object.labels())
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.state();
        let name = object.name_any();
        let key = (resource.kind.clone(), namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!(
                "{} '{}'",
                resource.kind, name
            )));
        }
        state.uid_counter += 1;
        let mut stored = object.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(format!("uid-{}", state.uid_counter));
        state.created.push((resource.kind.clone(), name));
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        let key = (resource.kind.clone(), namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_some() {
            state.deleted.push((resource.kind.clone(), name.to_string()));
        }
        Ok(())
    }

    async fn logs(&self, _namespace: &str, pod: &str, _container: &str) -> Result<String, ClusterError> {
        self.state()
            .logs
            .get(pod)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("logs of pod '{pod}'")))
    }

    async fn get_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NotebookValidationJob>, ClusterError> {
        Ok(self.job(namespace, name))
    }

    async fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NotebookValidationJobStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::NotFound(format!("job '{name}'")))?;
        let previous = job.phase();
        job.status = Some(status.clone());
        state.status_writes += 1;
        if state.phase_history.is_empty() {
            state.phase_history.push(previous);
        }
        if state.phase_history.last() != Some(&status.phase) {
            state.phase_history.push(status.phase);
        }
        Ok(())
    }

    async fn add_finalizer(
        &self,
        job: &NotebookValidationJob,
        finalizer: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        if let Some(error) = state.fail_next_finalizer.take() {
            return Err(error);
        }
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        if let Some(stored) = state.jobs.get_mut(&key) {
            stored
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        job: &NotebookValidationJob,
        finalizer: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        let remove = match state.jobs.get_mut(&key) {
            Some(stored) => {
                if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
                stored.metadata.deletion_timestamp.is_some()
                    && stored.finalizers().is_empty()
            }
            None => false,
        };
        if remove {
            state.jobs.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes_objects::labels::{Component, JobLabels};

    #[test]
    fn test_selector_matching() {
        let job = JobLabels {
            namespace: "ml".to_string(),
            job_id: "0b9e5a1c".to_string(),
            owner: "train".to_string(),
        };
        let mut pod_labels = job.labels(Component::Validation);
        pod_labels.insert("app".to_string(), "extra".to_string());

        assert!(selector_matches(&job.selector(Component::Validation), &pod_labels));
        assert!(selector_matches(&job.job_selector(), &pod_labels));
        assert!(!selector_matches(&job.selector(Component::Build), &pod_labels));
    }
}
