use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    BuildInfo, BuildRequest, Strategy, StrategyError, delete_labeled, manifest,
    pin_digest, string_at,
};
use crate::cluster::{Capability, Cluster, create_if_absent, latest_attempt, list_live};
use crate::config::BuildSettings;
use crate::kubernetes_objects::labels::{Component, JobLabels};
use crate::kubernetes_objects::notebook_validation_job::{BuildConfigSpec, BuildPhase};

pub const BUILD_CONFIG: Capability = Capability {
    group: "build.openshift.io",
    version: "v1",
    kind: "BuildConfig",
    plural: "buildconfigs",
};

pub const BUILD: Capability = Capability {
    group: "build.openshift.io",
    version: "v1",
    kind: "Build",
    plural: "builds",
};

pub const IMAGE_STREAM: Capability = Capability {
    group: "image.openshift.io",
    version: "v1",
    kind: "ImageStream",
    plural: "imagestreams",
};

const CAPABILITIES: [Capability; 2] = [BUILD_CONFIG, IMAGE_STREAM];

const CONTEXT_DIR_KEY: &str = "contextDir";

/// Build failure reasons that point at the definition, not the run.
const CONFIGURATION_REASONS: [&str; 3] = [
    "InvalidOutputReference",
    "InvalidImageReference",
    "CannotRetrieveServiceAccount",
];

/// Source-to-image builds: an image stream, a build config and one build per attempt.
#[derive(Debug, Clone)]
pub struct SourceBuildStrategy {
    settings: BuildSettings,
}

impl SourceBuildStrategy {
    pub const NAME: &'static str = "s2i";

    pub fn new(settings: BuildSettings) -> Self {
        SourceBuildStrategy { settings }
    }

    fn template_name(owner: &str) -> String {
        format!("{owner}-build")
    }

    fn default_image(&self, target: &JobLabels) -> String {
        format!(
            "{}/{}/{}:latest",
            self.settings.registry,
            target.namespace,
            Self::template_name(&target.owner)
        )
    }

    fn build_spec(&self, request: &BuildRequest<'_>) -> serde_json::Value {
        let mut source = json!({
            "type": "Git",
            "git": {
                "uri": request.git.url,
                "ref": request.git.git_ref,
            },
        });
        if let Some(context_dir) = request.config.strategy_config.get(CONTEXT_DIR_KEY) {
            source["contextDir"] = json!(context_dir);
        }
        if let Some(secret) = &request.git.credentials_secret {
            source["sourceSecret"] = json!({ "name": secret });
        }

        json!({
            "source": source,
            "strategy": {
                "type": "Source",
                "sourceStrategy": {
                    "from": {
                        "kind": "DockerImage",
                        "name": request.base_image(&self.settings),
                    },
                },
            },
            "output": {
                "to": {
                    "kind": "ImageStreamTag",
                    "name": format!("{}:latest", Self::template_name(&request.labels.owner)),
                },
            },
        })
    }

    fn image_stream(&self, request: &BuildRequest<'_>) -> Result<DynamicObject, StrategyError> {
        manifest(json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": IMAGE_STREAM.kind,
            "metadata": request.metadata(&Self::template_name(&request.labels.owner)),
            "spec": {
                "lookupPolicy": { "local": true },
            },
        }))
    }

    fn build_config(&self, request: &BuildRequest<'_>) -> Result<DynamicObject, StrategyError> {
        let mut spec = self.build_spec(request);
        spec["runPolicy"] = json!("Serial");
        manifest(json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": BUILD_CONFIG.kind,
            "metadata": request.metadata(&Self::template_name(&request.labels.owner)),
            "spec": spec,
        }))
    }

    fn build(&self, request: &BuildRequest<'_>) -> Result<DynamicObject, StrategyError> {
        let mut metadata = request.metadata(&request.build_name());
        metadata["annotations"] = json!({
            "openshift.io/build-config.name": Self::template_name(&request.labels.owner),
        });
        let mut spec = self.build_spec(request);
        spec["triggeredBy"] = json!([{ "message": "Triggered by notebook validation job" }]);
        manifest(json!({
            "apiVersion": "build.openshift.io/v1",
            "kind": BUILD.kind,
            "metadata": metadata,
            "spec": spec,
        }))
    }

    fn build_info(&self, build: &DynamicObject, target: &JobLabels) -> BuildInfo {
        let native_phase = string_at(build, "/status/phase").unwrap_or_default();
        let phase = map_phase(native_phase);
        let reason = string_at(build, "/status/reason");
        let message = string_at(build, "/status/message")
            .or(reason)
            .map(str::to_string);

        let image_reference = (phase == BuildPhase::Complete).then(|| {
            let image = string_at(build, "/status/outputDockerImageReference")
                .map(str::to_string)
                .unwrap_or_else(|| self.default_image(target));
            pin_digest(&image, string_at(build, "/status/output/to/imageDigest"))
        });

        BuildInfo {
            name: build.name_any(),
            phase,
            message,
            image_reference,
            start_time: string_at(build, "/status/startTimestamp").map(str::to_string),
            completion_time: string_at(build, "/status/completionTimestamp").map(str::to_string),
            configuration_failure: phase == BuildPhase::Failed
                && reason.is_some_and(|r| CONFIGURATION_REASONS.contains(&r)),
        }
    }
}

fn map_phase(native: &str) -> BuildPhase {
    match native {
        "New" | "Pending" => BuildPhase::Pending,
        "Running" => BuildPhase::Running,
        "Complete" => BuildPhase::Complete,
        "Failed" | "Error" => BuildPhase::Failed,
        "Cancelled" => BuildPhase::Cancelled,
        _ => BuildPhase::Unknown,
    }
}

impl Strategy for SourceBuildStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn capabilities(&self) -> &'static [Capability] {
        &CAPABILITIES
    }

    fn owned_resources(&self) -> Vec<ApiResource> {
        vec![
            BUILD.api_resource(),
            BUILD_CONFIG.api_resource(),
            IMAGE_STREAM.api_resource(),
        ]
    }

    fn validate(&self, config: &BuildConfigSpec) -> Result<(), StrategyError> {
        let invalid = |reason: &str| StrategyError::InvalidConfig {
            strategy: Self::NAME,
            reason: reason.to_string(),
        };
        if config.dockerfile_path.as_deref().is_some_and(|p| !p.is_empty()) {
            return Err(invalid(
                "source builds do not read a custom build file, use the tekton strategy",
            ));
        }
        if let Some(dir) = config.strategy_config.get(CONTEXT_DIR_KEY)
            && (dir.starts_with('/') || dir.split('/').any(|part| part == ".."))
        {
            return Err(invalid("contextDir must be a relative path inside the repository"));
        }
        Ok(())
    }

    #[instrument(
        "s2i/create_build",
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
            &IMAGE_STREAM.api_resource(),
            namespace,
            &self.image_stream(request)?,
        )
        .await?;
        create_if_absent(
            cluster,
            &BUILD_CONFIG.api_resource(),
            namespace,
            &self.build_config(request)?,
        )
        .await?;
        create_if_absent(cluster, &BUILD.api_resource(), namespace, &self.build(request)?).await?;
        debug!("Created source build {}", request.build_name());
        Ok(BuildInfo::pending(request.build_name()))
    }

    async fn get_status<C: Cluster>(
        &self,
        cluster: &C,
        target: &JobLabels,
    ) -> Result<Option<BuildInfo>, StrategyError> {
        let builds = list_live(
            cluster,
            &BUILD.api_resource(),
            &target.namespace,
            &target.selector(Component::Build),
        )
        .await?;
        Ok(latest_attempt(builds).map(|build| self.build_info(&build, target)))
    }

    #[instrument("s2i/delete", skip(self, cluster), fields(job = %target.owner))]
    async fn delete<C: Cluster>(&self, cluster: &C, target: &JobLabels) -> Result<(), StrategyError> {
        Ok(delete_labeled(cluster, &self.owned_resources(), target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::kubernetes_objects::notebook_validation_job::GitSpec;

    fn labels() -> JobLabels {
        JobLabels {
            namespace: "ml".into(),
            job_id: "uid-1".into(),
            owner: "train".into(),
        }
    }

    fn git() -> GitSpec {
        GitSpec {
            url: "https://github.com/org/notebooks.git".into(),
            git_ref: "v1.2".into(),
            credentials_secret: Some("git-creds".into()),
        }
    }

    fn strategy() -> SourceBuildStrategy {
        SourceBuildStrategy::new(BuildSettings::default())
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(map_phase("New"), BuildPhase::Pending);
        assert_eq!(map_phase("Pending"), BuildPhase::Pending);
        assert_eq!(map_phase("Running"), BuildPhase::Running);
        assert_eq!(map_phase("Complete"), BuildPhase::Complete);
        assert_eq!(map_phase("Error"), BuildPhase::Failed);
        assert_eq!(map_phase("Failed"), BuildPhase::Failed);
        assert_eq!(map_phase("Cancelled"), BuildPhase::Cancelled);
        assert_eq!(map_phase(""), BuildPhase::Unknown);
    }

    #[test]
    fn test_validate_rejects_custom_build_file() {
        let mut config = BuildConfigSpec {
            enabled: true,
            dockerfile_path: Some("docker/Dockerfile".into()),
            ..Default::default()
        };
        assert!(matches!(
            strategy().validate(&config),
            Err(StrategyError::InvalidConfig { strategy: "s2i", .. })
        ));

        config.dockerfile_path = None;
        config
            .strategy_config
            .insert(CONTEXT_DIR_KEY.into(), "../outside".into());
        assert!(strategy().validate(&config).is_err());

        config
            .strategy_config
            .insert(CONTEXT_DIR_KEY.into(), "notebooks".into());
        assert!(strategy().validate(&config).is_ok());
    }

    #[tokio::test]
    async fn test_create_build_manifests() {
        let cluster = FakeCluster::new();
        let labels = labels();
        let git = git();
        let config = BuildConfigSpec {
            enabled: true,
            base_image: Some("quay.io/base:1".into()),
            ..Default::default()
        };
        let request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "nb/train.ipynb",
            config: &config,
            container_image: "",
            attempt: 2,
        };

        let info = strategy().create_build(&cluster, &request).await.unwrap();
        assert_eq!(info.name, "train-build-2");
        assert_eq!(info.phase, BuildPhase::Pending);

        let build = cluster.object("Build", "ml", "train-build-2").unwrap();
        assert_eq!(build.labels(), &labels.labels(Component::Build));
        assert_eq!(
            build.data["spec"]["source"]["git"]["ref"],
            json!("v1.2")
        );
        assert_eq!(
            build.data["spec"]["source"]["sourceSecret"]["name"],
            json!("git-creds")
        );
        assert_eq!(
            build.data["spec"]["strategy"]["sourceStrategy"]["from"]["name"],
            json!("quay.io/base:1")
        );
        assert_eq!(
            build.data["spec"]["output"]["to"]["name"],
            json!("train-build:latest")
        );
        assert!(cluster.object("BuildConfig", "ml", "train-build").is_some());
        assert!(cluster.object("ImageStream", "ml", "train-build").is_some());

        // templates are reused by later attempts
        let request = BuildRequest { attempt: 3, ..request };
        strategy().create_build(&cluster, &request).await.unwrap();
        assert_eq!(cluster.created("BuildConfig").len(), 1);
        assert_eq!(cluster.created("Build").len(), 2);
    }

    #[tokio::test]
    async fn test_status_and_image_of_latest_build() {
        let cluster = FakeCluster::new();
        let labels = labels();
        let git = git();
        let config = BuildConfigSpec::default();
        let request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "train.ipynb",
            config: &config,
            container_image: "quay.io/jupyter/minimal-notebook:latest",
            attempt: 1,
        };
        let strategy = strategy();
        assert_eq!(strategy.get_status(&cluster, &labels).await.unwrap(), None);

        strategy.create_build(&cluster, &request).await.unwrap();
        cluster.set_object_status(
            "Build",
            "ml",
            "train-build-1",
            json!({ "phase": "Running", "startTimestamp": "2026-01-01T00:00:00Z" }),
        );
        let info = strategy.get_status(&cluster, &labels).await.unwrap().unwrap();
        assert_eq!(info.phase, BuildPhase::Running);
        assert_eq!(info.start_time.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(strategy.get_image(&cluster, &labels).await.unwrap(), None);

        cluster.set_object_status(
            "Build",
            "ml",
            "train-build-1",
            json!({
                "phase": "Complete",
                "outputDockerImageReference": "image-registry.openshift-image-registry.svc:5000/ml/train-build:latest",
                "output": { "to": { "imageDigest": "sha256:feed" } },
            }),
        );
        assert_eq!(
            strategy.get_image(&cluster, &labels).await.unwrap().as_deref(),
            Some("image-registry.openshift-image-registry.svc:5000/ml/train-build@sha256:feed")
        );
    }

    #[tokio::test]
    async fn test_configuration_failure_reason() {
        let cluster = FakeCluster::new();
        let labels = labels();
        let git = git();
        let config = BuildConfigSpec::default();
        let request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "train.ipynb",
            config: &config,
            container_image: "",
            attempt: 1,
        };
        let strategy = strategy();
        strategy.create_build(&cluster, &request).await.unwrap();
        cluster.set_object_status(
            "Build",
            "ml",
            "train-build-1",
            json!({ "phase": "Failed", "reason": "InvalidOutputReference" }),
        );
        let info = strategy.get_status(&cluster, &labels).await.unwrap().unwrap();
        assert_eq!(info.phase, BuildPhase::Failed);
        assert!(info.configuration_failure);
        assert_eq!(info.message.as_deref(), Some("InvalidOutputReference"));
    }

    #[tokio::test]
    async fn test_delete_removes_everything_and_tolerates_absence() {
        let cluster = FakeCluster::new();
        let labels = labels();
        let git = git();
        let config = BuildConfigSpec::default();
        let request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "train.ipynb",
            config: &config,
            container_image: "",
            attempt: 1,
        };
        let strategy = strategy();
        strategy.create_build(&cluster, &request).await.unwrap();
        assert_eq!(cluster.total_objects(), 3);

        strategy.delete(&cluster, &labels).await.unwrap();
        assert_eq!(cluster.total_objects(), 0);
        strategy.delete(&cluster, &labels).await.unwrap();
    }
}
