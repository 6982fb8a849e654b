use std::collections::BTreeMap;

use derive_debug::Dbg;
use json_patch::jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use kube::core::GroupVersion;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{Instrument, debug, instrument, trace_span};

use super::{Capability, Cluster, ClusterError};
use crate::kubernetes_objects::MANAGER_NAME;
use crate::kubernetes_objects::labels::selector_string;
use crate::kubernetes_objects::notebook_validation_job::{
    NotebookValidationJob, NotebookValidationJobStatus,
};

#[derive(Dbg, Clone)]
pub struct KubeCluster {
    #[dbg(skip)]
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    fn dynamic_api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    fn job_api(&self, namespace: &str) -> Api<NotebookValidationJob> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl Cluster for KubeCluster {
    #[instrument("cluster/discover", skip(self), fields(capability = %capability), level = "debug")]
    async fn discover(&self, capability: &Capability) -> Result<bool, ClusterError> {
        let gv = GroupVersion::gv(capability.group, capability.version);
        match kube::discovery::pinned_group(&self.client, &gv).await {
            Ok(group) => Ok(group.recommended_kind(capability.kind).is_some()),
            Err(kube::Error::Discovery(e)) => {
                debug!("Capability {} not served: {}", capability, e);
                Ok(false)
            }
            Err(e) => match ClusterError::from(e) {
                ClusterError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let api = self.dynamic_api(resource, namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        let list = async { api.list(&params).await }
            .instrument(trace_span!(
                "list_objects",
                kubernetes_namespace = %namespace,
                kind = %resource.kind
            ))
            .await?;
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.dynamic_api(resource, namespace);
        let params = PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..Default::default()
        };
        let created = async { api.create(&params, object).await }
            .instrument(trace_span!(
                "create_object",
                kubernetes_namespace = %namespace,
                kind = %resource.kind,
                name = %object.name_any()
            ))
            .await?;
        Ok(created)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let api = self.dynamic_api(resource, namespace);
        let result = async { api.delete(name, &DeleteParams::background()).await }
            .instrument(trace_span!(
                "delete_object",
                kubernetes_namespace = %namespace,
                kind = %resource.kind,
                name = %name
            ))
            .await;
        match result.map_err(ClusterError::from) {
            Ok(_) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        let logs = async { api.logs(pod, &params).await }
            .instrument(trace_span!("get_pod_logs", kubernetes_namespace = %namespace, pod = %pod))
            .await?;
        Ok(logs)
    }

    async fn get_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NotebookValidationJob>, ClusterError> {
        Ok(self.job_api(namespace).get_opt(name).await?)
    }

    async fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NotebookValidationJobStatus,
    ) -> Result<(), ClusterError> {
        let patch = json!({ "status": status });
        async {
            self.job_api(namespace)
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
        }
        .instrument(trace_span!(
            "patch_job_status",
            kubernetes_namespace = %namespace,
            job_name = %name
        ))
        .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        job: &NotebookValidationJob,
        finalizer: &str,
    ) -> Result<(), ClusterError> {
        let finalizers_path = PointerBuf::from_tokens(["metadata", "finalizers"]);
        let operations = if job.finalizers().is_empty() {
            vec![
                json_patch::PatchOperation::Test(json_patch::TestOperation {
                    path: finalizers_path.clone(),
                    value: serde_json::Value::Null,
                }),
                json_patch::PatchOperation::Add(json_patch::AddOperation {
                    path: finalizers_path,
                    value: json!([finalizer]),
                }),
            ]
        } else {
            vec![
                json_patch::PatchOperation::Test(json_patch::TestOperation {
                    path: finalizers_path,
                    value: json!(job.finalizers()),
                }),
                json_patch::PatchOperation::Add(json_patch::AddOperation {
                    path: PointerBuf::from_tokens(["metadata", "finalizers", "-"]),
                    value: json!(finalizer),
                }),
            ]
        };
        self.patch_job_metadata(job, operations).await
    }

    async fn remove_finalizer(
        &self,
        job: &NotebookValidationJob,
        finalizer: &str,
    ) -> Result<(), ClusterError> {
        let Some(index) = job.finalizers().iter().position(|f| f == finalizer) else {
            return Ok(());
        };
        let index = index.to_string();
        let path = PointerBuf::from_tokens(["metadata", "finalizers", index.as_str()]);
        let operations = vec![
            json_patch::PatchOperation::Test(json_patch::TestOperation {
                path: path.clone(),
                value: json!(finalizer),
            }),
            json_patch::PatchOperation::Remove(json_patch::RemoveOperation { path }),
        ];
        match self.patch_job_metadata(job, operations).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl KubeCluster {
    async fn patch_job_metadata(
        &self,
        job: &NotebookValidationJob,
        operations: Vec<json_patch::PatchOperation>,
    ) -> Result<(), ClusterError> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let patch = Patch::Json::<()>(json_patch::Patch(operations));
        async {
            self.job_api(&namespace)
                .patch(&name, &PatchParams::default(), &patch)
                .await
        }
        .instrument(trace_span!(
            "patch_job_finalizers",
            kubernetes_namespace = %namespace,
            job_name = %name
        ))
        .await
        .map_err(|e| finalizer_patch_error(e.into()))?;
        Ok(())
    }
}

/// A failed `test` operation comes back as 422: someone else changed the finalizers
/// since the job was read.
fn finalizer_patch_error(err: ClusterError) -> ClusterError {
    match err {
        ClusterError::Rejected(message) => ClusterError::Conflict(message),
        other => other,
    }
}
