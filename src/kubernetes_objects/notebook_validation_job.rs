use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A request to build (optionally) and execute a notebook, reporting per-cell results.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "mlops.mlops.dev",
    version = "v1alpha1",
    kind = "NotebookValidationJob",
    plural = "notebookvalidationjobs",
    shortname = "nvj",
    status = "NotebookValidationJobStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".status.buildStatus.strategy"}"#,
    printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobSpec {
    pub notebook: NotebookSpec,

    pub pod_config: PodConfigSpec,

    /// Overall wall-clock budget, e.g. "30m" or "1h30m"
    #[serde(default = "default_timeout")]
    pub timeout: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_validation: Option<ModelValidationSpec>,
}

fn default_timeout() -> String {
    "30m".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSpec {
    pub git: GitSpec,

    /// Path of the notebook inside the repository
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    pub url: String,

    #[serde(rename = "ref", default = "default_git_ref")]
    pub git_ref: String,

    /// Secret holding git credentials. Passed through, never read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

fn default_git_ref() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigSpec {
    /// Runnable image when build is disabled, default base image otherwise
    pub container_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_config: Option<BuildConfigSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Secret names injected as environment sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigSpec {
    #[serde(default)]
    pub enabled: bool,

    /// "s2i", "tekton" or "auto". Empty means "auto".
    #[serde(default)]
    pub strategy: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,

    /// Custom build file inside the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,

    /// Dependency manifest inside the repository, "requirements.txt" when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_file: Option<String>,

    /// What to do when the dependency manifest is missing
    #[serde(default)]
    pub fallback_strategy: FallbackPolicy,

    /// Strategy specific overrides, e.g. "registry"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strategy_config: BTreeMap<String, String>,
}

impl BuildConfigSpec {
    pub const AUTO: &'static str = "auto";

    /// The pinned strategy name, `None` when the registry should pick one.
    pub fn pinned_strategy(&self) -> Option<&str> {
        match self.strategy.trim() {
            "" | Self::AUTO => None,
            name => Some(name),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    #[default]
    Warn,
    Fail,
    Auto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct KeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvFromSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NamedRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<NamedRef>,
}

/// Checks against a model serving platform, run alongside the notebook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelValidationSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Platform to check, detected from the cluster when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<ServingPlatform>,

    #[serde(default)]
    pub phase: ModelValidationPhase,

    /// `model` in the job's namespace or `namespace/model`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_models: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_validation: Option<PredictionValidationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_platform: Option<CustomPlatformSpec>,

    #[serde(default = "default_model_timeout")]
    pub timeout: String,
}

fn default_true() -> bool {
    true
}

fn default_model_timeout() -> String {
    "5m".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ServingPlatform {
    Kserve,
    OpenshiftAi,
    Vllm,
    Torchserve,
    TensorflowServing,
    Triton,
    RayServe,
    Seldon,
    Bentoml,
    Custom,
}

impl ServingPlatform {
    pub fn as_str(self) -> &'static str {
        match self {
            ServingPlatform::Kserve => "kserve",
            ServingPlatform::OpenshiftAi => "openshift-ai",
            ServingPlatform::Vllm => "vllm",
            ServingPlatform::Torchserve => "torchserve",
            ServingPlatform::TensorflowServing => "tensorflow-serving",
            ServingPlatform::Triton => "triton",
            ServingPlatform::RayServe => "ray-serve",
            ServingPlatform::Seldon => "seldon",
            ServingPlatform::Bentoml => "bentoml",
            ServingPlatform::Custom => "custom",
        }
    }
}

impl fmt::Display for ServingPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `clean` checks the platform is installed, `existing` checks the target models are ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ModelValidationPhase {
    Clean,
    Existing,
    #[default]
    Both,
}

impl ModelValidationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelValidationPhase::Clean => "clean",
            ModelValidationPhase::Existing => "existing",
            ModelValidationPhase::Both => "both",
        }
    }

    pub fn checks_models(self) -> bool {
        matches!(self, ModelValidationPhase::Existing | ModelValidationPhase::Both)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PredictionValidationSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,

    #[serde(default = "default_tolerance")]
    pub tolerance: String,
}

fn default_tolerance() -> String {
    "0.01".to_string()
}

/// Endpoints of a platform the controller has no built-in knowledge of.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomPlatformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct NamedRef {
    pub name: String,
}

// Optional status fields serialize as null so that a merge patch clears them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobStatus {
    #[serde(default)]
    pub phase: JobPhase,

    #[serde(default)]
    pub build_status: Option<BuildStatus>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub results: Vec<CellResult>,

    /// Latest actionable diagnostic
    #[serde(default)]
    pub message: Option<String>,

    /// Originating reason code of a terminal failure
    #[serde(default)]
    pub reason: Option<Reason>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub last_retry_time: Option<String>,

    #[serde(default)]
    pub next_retry_time: Option<String>,

    #[serde(default)]
    pub start_time: Option<String>,

    #[serde(default)]
    pub completion_time: Option<String>,

    #[serde(default)]
    pub validation_pod_name: Option<String>,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub model_validation_result: Option<ModelValidationResult>,
}

/// Outcome of the serving platform checks. Advisory, never fails the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelValidationResult {
    pub phase: String,

    /// Checked platform, "unknown" when none was found
    pub platform: String,

    /// The platform was found by discovery rather than named on the job
    pub platform_detected: bool,

    /// API kinds of the platform the cluster serves
    #[serde(default)]
    pub crds_installed: Vec<String>,

    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum JobPhase {
    #[default]
    Pending,
    Initializing,
    Building,
    BuildComplete,
    ValidationRunning,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    /// Position along the forward sequence. Both terminal phases share the last slot.
    pub fn rank(self) -> u8 {
        match self {
            JobPhase::Pending => 0,
            JobPhase::Initializing => 1,
            JobPhase::Building => 2,
            JobPhase::BuildComplete => 3,
            JobPhase::ValidationRunning => 4,
            JobPhase::Succeeded | JobPhase::Failed => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "Pending",
            JobPhase::Initializing => "Initializing",
            JobPhase::Building => "Building",
            JobPhase::BuildComplete => "BuildComplete",
            JobPhase::ValidationRunning => "ValidationRunning",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub phase: BuildPhase,

    /// Name of the strategy actually used
    #[serde(default)]
    pub strategy: String,

    /// Non-empty iff phase is Complete
    #[serde(default)]
    pub image_reference: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub start_time: Option<String>,

    #[serde(default)]
    pub completion_time: Option<String>,

    #[serde(default)]
    pub build_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum BuildPhase {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
    Unknown,
}

impl BuildPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::Pending => "Pending",
            BuildPhase::Running => "Running",
            BuildPhase::Complete => "Complete",
            BuildPhase::Failed => "Failed",
            BuildPhase::Cancelled => "Cancelled",
            BuildPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: Reason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    BuildReady,
    ValidationReady,
    Progressing,
    Available,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Closed set of reason codes exposed on conditions and terminal failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum Reason {
    Initializing,
    InProgress,
    BuildPending,
    BuildInProgress,
    BuildComplete,
    BuildSkipped,
    WaitingForBuild,
    ValidationPending,
    ValidationInProgress,
    ValidationSucceeded,
    Succeeded,
    ConfigurationError,
    CapabilityUnavailable,
    TransientInfra,
    RetriableExecutionFailure,
    ResourceExhaustion,
    TerminalExecutionFailure,
    RetriesExhausted,
    Timeout,
    BuildFailed,
    ValidationFailed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CellResult {
    pub cell_index: u32,
    pub status: CellStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum CellStatus {
    Success,
    Failure,
    Skipped,
}

impl NotebookValidationJob {
    /// Build configuration when building is switched on.
    pub fn enabled_build(&self) -> Option<&BuildConfigSpec> {
        self.spec
            .pod_config
            .build_config
            .as_ref()
            .filter(|build| build.enabled)
    }

    /// Model validation settings when switched on.
    pub fn enabled_model_validation(&self) -> Option<&ModelValidationSpec> {
        self.spec
            .model_validation
            .as_ref()
            .filter(|model| model.enabled)
    }

    pub fn phase(&self) -> JobPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
