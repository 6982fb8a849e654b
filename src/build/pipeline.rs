use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::dockerfile::{GENERATE_SCRIPT, MissingManifest, notebook_dir};
use super::{
    BuildInfo, BuildRequest, Strategy, StrategyError, delete_labeled, manifest,
    pin_digest, string_at,
};
use crate::cluster::{Capability, Cluster, create_if_absent, latest_attempt, list_live};
use crate::config::BuildSettings;
use crate::kubernetes_objects::labels::{Component, JobLabels};
use crate::kubernetes_objects::notebook_validation_job::{BuildConfigSpec, BuildPhase};

pub const PIPELINE: Capability = Capability {
    group: "tekton.dev",
    version: "v1",
    kind: "Pipeline",
    plural: "pipelines",
};

pub const PIPELINE_RUN: Capability = Capability {
    group: "tekton.dev",
    version: "v1",
    kind: "PipelineRun",
    plural: "pipelineruns",
};

const CAPABILITIES: [Capability; 1] = [PIPELINE_RUN];

const REGISTRY_KEY: &str = "registry";

const IMAGE_PARAM: &str = "image-reference";
const DIGEST_RESULT: &str = "IMAGE_DIGEST";

/// Reasons on the `Succeeded` condition that mean the pipeline definition itself is broken.
const CONFIGURATION_REASONS: [&str; 5] = [
    "CouldntGetPipeline",
    "CouldntGetTask",
    "PipelineValidationFailed",
    "ParameterMissing",
    "InvalidWorkspaceBindings",
];

const CANCELLED_REASONS: [&str; 4] = [
    "Cancelled",
    "PipelineRunCancelled",
    "CancelledRunFinally",
    "StoppedRunFinally",
];

/// Tekton pipeline builds: fetch, generate a build file, build with buildah.
#[derive(Debug, Clone)]
pub struct PipelineStrategy {
    settings: BuildSettings,
}

impl PipelineStrategy {
    pub const NAME: &'static str = "tekton";

    pub fn new(settings: BuildSettings) -> Self {
        PipelineStrategy { settings }
    }

    fn pipeline_name(owner: &str) -> String {
        format!("{owner}-pipeline")
    }

    fn image_reference(&self, request: &BuildRequest<'_>) -> String {
        let registry = request
            .config
            .strategy_config
            .get(REGISTRY_KEY)
            .map(|r| r.trim_end_matches('/'))
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.settings.registry);
        format!(
            "{}/{}/{}-build:latest",
            registry, request.labels.namespace, request.labels.owner
        )
    }

    fn cluster_task(&self, task: &str) -> Value {
        json!({
            "resolver": "cluster",
            "params": [
                { "name": "kind", "value": "task" },
                { "name": "name", "value": task },
                { "name": "namespace", "value": self.settings.task_namespace },
            ],
        })
    }

    fn pipeline(&self, request: &BuildRequest<'_>) -> Result<DynamicObject, StrategyError> {
        let step_security = json!({
            "runAsNonRoot": true,
            "runAsUser": self.settings.build_user,
            "allowPrivilegeEscalation": false,
            "capabilities": { "drop": ["ALL"] },
        });
        let string_param = |name: &str| json!({ "name": name, "type": "string" });

        manifest(json!({
            "apiVersion": "tekton.dev/v1",
            "kind": PIPELINE.kind,
            "metadata": request.metadata(&Self::pipeline_name(&request.labels.owner)),
            "spec": {
                "params": [
                    string_param("git-url"),
                    { "name": "git-revision", "type": "string", "default": "main" },
                    string_param(IMAGE_PARAM),
                    string_param("base-image"),
                    { "name": "dockerfile-path", "type": "string", "default": "" },
                    { "name": "requirements-file", "type": "string", "default": "" },
                    { "name": "notebook-dir", "type": "string", "default": "." },
                    { "name": "fallback-policy", "type": "string", "default": "warn" },
                ],
                "workspaces": [
                    { "name": "shared-workspace" },
                    { "name": "git-credentials", "optional": true },
                ],
                "results": [
                    {
                        "name": DIGEST_RESULT,
                        "value": format!("$(tasks.build-image.results.{DIGEST_RESULT})"),
                    },
                ],
                "tasks": [
                    {
                        "name": "fetch-repository",
                        "taskRef": self.cluster_task("git-clone"),
                        "params": [
                            { "name": "URL", "value": "$(params.git-url)" },
                            { "name": "REVISION", "value": "$(params.git-revision)" },
                        ],
                        "workspaces": [
                            { "name": "output", "workspace": "shared-workspace" },
                            { "name": "basic-auth", "workspace": "git-credentials" },
                        ],
                    },
                    {
                        "name": "generate-dockerfile",
                        "runAfter": ["fetch-repository"],
                        "taskSpec": {
                            "params": [
                                string_param("BASE_IMAGE"),
                                string_param("DOCKERFILE_PATH"),
                                string_param("REQUIREMENTS_FILE"),
                                string_param("NOTEBOOK_DIR"),
                                string_param("MISSING_MANIFEST"),
                            ],
                            "workspaces": [{ "name": "source" }],
                            "steps": [
                                {
                                    "name": "generate",
                                    "image": self.settings.step_image,
                                    "script": GENERATE_SCRIPT,
                                    "securityContext": step_security,
                                },
                            ],
                        },
                        "params": [
                            { "name": "BASE_IMAGE", "value": "$(params.base-image)" },
                            { "name": "DOCKERFILE_PATH", "value": "$(params.dockerfile-path)" },
                            { "name": "REQUIREMENTS_FILE", "value": "$(params.requirements-file)" },
                            { "name": "NOTEBOOK_DIR", "value": "$(params.notebook-dir)" },
                            { "name": "MISSING_MANIFEST", "value": "$(params.fallback-policy)" },
                        ],
                        "workspaces": [
                            { "name": "source", "workspace": "shared-workspace" },
                        ],
                    },
                    {
                        "name": "build-image",
                        "runAfter": ["generate-dockerfile"],
                        "taskRef": self.cluster_task("buildah"),
                        "params": [
                            { "name": "IMAGE", "value": format!("$(params.{IMAGE_PARAM})") },
                            { "name": "DOCKERFILE", "value": "./Dockerfile" },
                            { "name": "CONTEXT", "value": "." },
                        ],
                        "workspaces": [
                            { "name": "source", "workspace": "shared-workspace" },
                        ],
                    },
                ],
            },
        }))
    }

    fn pipeline_run(&self, request: &BuildRequest<'_>) -> Result<DynamicObject, StrategyError> {
        let missing_manifest =
            MissingManifest::resolve(request.config.fallback_strategy, self.settings.auto_fallback);
        let param = |name: &str, value: &str| json!({ "name": name, "value": value });

        let mut workspaces = vec![json!({
            "name": "shared-workspace",
            "volumeClaimTemplate": {
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": {
                        "requests": { "storage": self.settings.workspace_size },
                    },
                },
            },
        })];
        if let Some(secret) = &request.git.credentials_secret {
            workspaces.push(json!({
                "name": "git-credentials",
                "secret": { "secretName": secret },
            }));
        }

        manifest(json!({
            "apiVersion": "tekton.dev/v1",
            "kind": PIPELINE_RUN.kind,
            "metadata": request.metadata(&request.build_name()),
            "spec": {
                "pipelineRef": { "name": Self::pipeline_name(&request.labels.owner) },
                "params": [
                    param("git-url", &request.git.url),
                    param("git-revision", &request.git.git_ref),
                    param(IMAGE_PARAM, &self.image_reference(request)),
                    param("base-image", &request.base_image(&self.settings)),
                    param("dockerfile-path", request.config.dockerfile_path.as_deref().unwrap_or_default()),
                    param("requirements-file", request.config.requirements_file.as_deref().unwrap_or_default()),
                    param("notebook-dir", notebook_dir(request.notebook_path)),
                    param("fallback-policy", missing_manifest.as_str()),
                ],
                "workspaces": workspaces,
                "taskRunTemplate": {
                    "podTemplate": {
                        "securityContext": {
                            "fsGroup": self.settings.build_user,
                            "runAsUser": self.settings.build_user,
                            "runAsNonRoot": true,
                        },
                    },
                },
            },
        }))
    }
}

fn succeeded_condition(run: &DynamicObject) -> Option<&Value> {
    run.data
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("Succeeded"))
}

fn map_condition(status: Option<&str>, reason: Option<&str>) -> BuildPhase {
    match (status, reason) {
        (None, _) => BuildPhase::Pending,
        (Some("True"), _) => BuildPhase::Complete,
        (Some("False"), Some(r)) if CANCELLED_REASONS.contains(&r) => BuildPhase::Cancelled,
        (Some("False"), _) => BuildPhase::Failed,
        (Some("Unknown"), Some("Pending" | "PipelineRunPending")) => BuildPhase::Pending,
        (Some("Unknown"), _) => BuildPhase::Running,
        (Some(_), _) => BuildPhase::Unknown,
    }
}

fn param_value<'a>(run: &'a DynamicObject, name: &str) -> Option<&'a str> {
    run.data
        .pointer("/spec/params")?
        .as_array()?
        .iter()
        .find(|p| p.get("name").and_then(Value::as_str) == Some(name))?
        .get("value")?
        .as_str()
}

fn result_value<'a>(run: &'a DynamicObject, name: &str) -> Option<&'a str> {
    run.data
        .pointer("/status/results")?
        .as_array()?
        .iter()
        .find(|r| r.get("name").and_then(Value::as_str) == Some(name))?
        .get("value")?
        .as_str()
}

fn build_info(run: &DynamicObject) -> BuildInfo {
    let condition = succeeded_condition(run);
    let field = |key: &str| condition.and_then(|c| c.get(key)).and_then(Value::as_str);
    let reason = field("reason");
    let phase = map_condition(field("status"), reason);

    let image_reference = (phase == BuildPhase::Complete)
        .then(|| param_value(run, IMAGE_PARAM))
        .flatten()
        .map(|image| pin_digest(image, result_value(run, DIGEST_RESULT)));

    BuildInfo {
        name: run.name_any(),
        phase,
        message: field("message").filter(|m| !m.is_empty()).map(str::to_string),
        image_reference,
        start_time: string_at(run, "/status/startTime").map(str::to_string),
        completion_time: string_at(run, "/status/completionTime").map(str::to_string),
        configuration_failure: phase == BuildPhase::Failed
            && reason.is_some_and(|r| CONFIGURATION_REASONS.contains(&r)),
    }
}

fn is_relative_inside(path: &str) -> bool {
    !path.starts_with('/') && !path.split('/').any(|part| part == "..")
}

impl Strategy for PipelineStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn capabilities(&self) -> &'static [Capability] {
        &CAPABILITIES
    }

    fn owned_resources(&self) -> Vec<ApiResource> {
        vec![PIPELINE_RUN.api_resource(), PIPELINE.api_resource()]
    }

    fn validate(&self, config: &BuildConfigSpec) -> Result<(), StrategyError> {
        let invalid = |reason: String| StrategyError::InvalidConfig {
            strategy: Self::NAME,
            reason,
        };
        for (field, path) in [
            ("dockerfilePath", &config.dockerfile_path),
            ("requirementsFile", &config.requirements_file),
        ] {
            if let Some(path) = path
                && !is_relative_inside(path)
            {
                return Err(invalid(format!(
                    "{field} '{path}' must be a relative path inside the repository"
                )));
            }
        }
        if let Some(registry) = config.strategy_config.get(REGISTRY_KEY)
            && (registry.trim().is_empty() || registry.contains("://"))
        {
            return Err(invalid(format!(
                "registry '{registry}' must be a host[:port][/path] without a scheme"
            )));
        }
        Ok(())
    }

    #[instrument(
        "tekton/create_build",
        skip(self, cluster, request),
        fields(job = %request.labels.owner, attempt = request.attempt)
    )]
    async fn create_build<C: Cluster>(
        &self,
        cluster: &C,
        request: &BuildRequest<'_>,
    ) -> Result<BuildInfo, StrategyError> {
        let namespace = &request.labels.namespace;
        create_if_absent(
            cluster,
            &PIPELINE.api_resource(),
            namespace,
            &self.pipeline(request)?,
        )
        .await?;
        create_if_absent(
            cluster,
            &PIPELINE_RUN.api_resource(),
            namespace,
            &self.pipeline_run(request)?,
        )
        .await?;
        debug!("Created pipeline run {}", request.build_name());
        Ok(BuildInfo::pending(request.build_name()))
    }

    async fn get_status<C: Cluster>(
        &self,
        cluster: &C,
        target: &JobLabels,
    ) -> Result<Option<BuildInfo>, StrategyError> {
        let runs = list_live(
            cluster,
            &PIPELINE_RUN.api_resource(),
            &target.namespace,
            &target.selector(Component::Build),
        )
        .await?;
        Ok(latest_attempt(runs).as_ref().map(build_info))
    }

    #[instrument("tekton/delete", skip(self, cluster), fields(job = %target.owner))]
    async fn delete<C: Cluster>(&self, cluster: &C, target: &JobLabels) -> Result<(), StrategyError> {
        Ok(delete_labeled(cluster, &self.owned_resources(), target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::kubernetes_objects::notebook_validation_job::{FallbackPolicy, GitSpec};

    fn labels() -> JobLabels {
        JobLabels {
            namespace: "ml".into(),
            job_id: "uid-7".into(),
            owner: "train".into(),
        }
    }

    fn git(secret: Option<&str>) -> GitSpec {
        GitSpec {
            url: "https://github.com/org/notebooks.git".into(),
            git_ref: "main".into(),
            credentials_secret: secret.map(str::to_string),
        }
    }

    fn params(run: &DynamicObject) -> Vec<(String, String)> {
        run.data["spec"]["params"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| {
                (
                    p["name"].as_str().unwrap().to_string(),
                    p["value"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_condition_mapping() {
        assert_eq!(map_condition(None, None), BuildPhase::Pending);
        assert_eq!(map_condition(Some("True"), Some("Succeeded")), BuildPhase::Complete);
        assert_eq!(map_condition(Some("False"), Some("Failed")), BuildPhase::Failed);
        assert_eq!(
            map_condition(Some("False"), Some("CancelledRunFinally")),
            BuildPhase::Cancelled
        );
        assert_eq!(map_condition(Some("Unknown"), Some("Running")), BuildPhase::Running);
        assert_eq!(
            map_condition(Some("Unknown"), Some("PipelineRunPending")),
            BuildPhase::Pending
        );
        assert_eq!(map_condition(Some("Weird"), None), BuildPhase::Unknown);
    }

    #[test]
    fn test_validate() {
        let strategy = PipelineStrategy::new(BuildSettings::default());
        let mut config = BuildConfigSpec {
            enabled: true,
            dockerfile_path: Some("docker/Dockerfile.gpu".into()),
            ..Default::default()
        };
        assert!(strategy.validate(&config).is_ok());

        config.dockerfile_path = Some("/etc/Dockerfile".into());
        assert!(strategy.validate(&config).is_err());

        config.dockerfile_path = None;
        config.requirements_file = Some("../requirements.txt".into());
        assert!(strategy.validate(&config).is_err());

        config.requirements_file = None;
        config
            .strategy_config
            .insert(REGISTRY_KEY.into(), "https://quay.io".into());
        let err = strategy.validate(&config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn test_pipeline_run_manifest() {
        let cluster = FakeCluster::new();
        let labels = labels();
        let git = git(Some("git-creds"));
        let mut config = BuildConfigSpec {
            enabled: true,
            dockerfile_path: Some("Containerfile".into()),
            fallback_strategy: FallbackPolicy::Auto,
            ..Default::default()
        };
        config
            .strategy_config
            .insert(REGISTRY_KEY.into(), "quay.io/team/".into());
        let request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "notebooks/train.ipynb",
            config: &config,
            container_image: "quay.io/jupyter/scipy-notebook:latest",
            attempt: 1,
        };
        let strategy = PipelineStrategy::new(BuildSettings::default());
        strategy.create_build(&cluster, &request).await.unwrap();

        let run = cluster.object("PipelineRun", "ml", "train-build-1").unwrap();
        assert_eq!(run.labels(), &labels.labels(Component::Build));
        let params = params(&run);
        let find = |name: &str| {
            params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(find(IMAGE_PARAM), "quay.io/team/ml/train-build:latest");
        assert_eq!(find("base-image"), "quay.io/jupyter/scipy-notebook:latest");
        assert_eq!(find("dockerfile-path"), "Containerfile");
        assert_eq!(find("notebook-dir"), "notebooks");
        assert_eq!(find("fallback-policy"), "skip");

        assert_eq!(
            run.data["spec"]["workspaces"][1]["secret"]["secretName"],
            json!("git-creds")
        );
        assert_eq!(
            run.data["spec"]["workspaces"][0]["volumeClaimTemplate"]["spec"]["resources"]
                ["requests"]["storage"],
            json!("1Gi")
        );
        let pod_security = &run.data["spec"]["taskRunTemplate"]["podTemplate"]["securityContext"];
        assert_eq!(pod_security["fsGroup"], json!(65532));
        assert_eq!(pod_security["runAsNonRoot"], json!(true));

        let pipeline = cluster.object("Pipeline", "ml", "train-pipeline").unwrap();
        let tasks = pipeline.data["spec"]["tasks"].as_array().unwrap();
        let names: Vec<_> = tasks.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["fetch-repository", "generate-dockerfile", "build-image"]);
        let step = &tasks[1]["taskSpec"]["steps"][0];
        assert_eq!(step["securityContext"]["allowPrivilegeEscalation"], json!(false));
        assert_eq!(step["securityContext"]["runAsNonRoot"], json!(true));
    }

    #[tokio::test]
    async fn test_status_image_and_configuration_failure() {
        let cluster = FakeCluster::new();
        let labels = labels();
        let git = git(None);
        let config = BuildConfigSpec::default();
        let strategy = PipelineStrategy::new(BuildSettings::default());
        let request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "train.ipynb",
            config: &config,
            container_image: "",
            attempt: 1,
        };
        strategy.create_build(&cluster, &request).await.unwrap();
        let run = cluster.object("PipelineRun", "ml", "train-build-1").unwrap();
        assert_eq!(run.data["spec"]["workspaces"].as_array().unwrap().len(), 1);

        let info = strategy.get_status(&cluster, &labels).await.unwrap().unwrap();
        assert_eq!(info.phase, BuildPhase::Pending);

        cluster.set_object_status(
            "PipelineRun",
            "ml",
            "train-build-1",
            json!({
                "conditions": [{ "type": "Succeeded", "status": "True", "reason": "Succeeded" }],
                "results": [{ "name": DIGEST_RESULT, "value": "sha256:0123" }],
            }),
        );
        assert_eq!(
            strategy.get_image(&cluster, &labels).await.unwrap().as_deref(),
            Some("image-registry.openshift-image-registry.svc:5000/ml/train-build@sha256:0123")
        );

        cluster.set_object_status(
            "PipelineRun",
            "ml",
            "train-build-1",
            json!({
                "conditions": [{
                    "type": "Succeeded",
                    "status": "False",
                    "reason": "CouldntGetTask",
                    "message": "task buildah not found",
                }],
            }),
        );
        let info = strategy.get_status(&cluster, &labels).await.unwrap().unwrap();
        assert_eq!(info.phase, BuildPhase::Failed);
        assert!(info.configuration_failure);
        assert_eq!(info.message.as_deref(), Some("task buildah not found"));

        strategy.delete(&cluster, &labels).await.unwrap();
        assert_eq!(cluster.total_objects(), 0);
        assert_eq!(strategy.get_status(&cluster, &labels).await.unwrap(), None);
    }
}
