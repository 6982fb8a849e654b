//! Model serving platforms a notebook can be checked against.
//!
//! Platforms are found the same way build strategies are: by asking the cluster whether it
//! serves their API kinds. Deployment based platforms have no kinds of their own and are
//! taken at their word.

use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;
use kube::api::DynamicObject;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cluster::{Capability, Cluster, ClusterError};
use crate::kubernetes_objects::notebook_validation_job::{
    ModelValidationResult, ModelValidationSpec, ServingPlatform,
};

pub const INFERENCE_SERVICE: Capability = Capability {
    group: "serving.kserve.io",
    version: "v1beta1",
    kind: "InferenceService",
    plural: "inferenceservices",
};

pub const SERVING_RUNTIME: Capability = Capability {
    group: "serving.kserve.io",
    version: "v1alpha1",
    kind: "ServingRuntime",
    plural: "servingruntimes",
};

pub const RAY_SERVICE: Capability = Capability {
    group: "ray.io",
    version: "v1",
    kind: "RayService",
    plural: "rayservices",
};

pub const RAY_CLUSTER: Capability = Capability {
    group: "ray.io",
    version: "v1",
    kind: "RayCluster",
    plural: "rayclusters",
};

pub const SELDON_DEPLOYMENT: Capability = Capability {
    group: "machinelearning.seldon.io",
    version: "v1",
    kind: "SeldonDeployment",
    plural: "seldondeployments",
};

pub const BENTO: Capability = Capability {
    group: "serving.yatai.ai",
    version: "v1alpha1",
    kind: "Bento",
    plural: "bentos",
};

pub const BENTO_DEPLOYMENT: Capability = Capability {
    group: "serving.yatai.ai",
    version: "v2alpha1",
    kind: "BentoDeployment",
    plural: "bentodeployments",
};

/// The API kinds a platform installs and the one its models are stored as.
#[derive(Debug)]
struct PlatformKinds {
    platform: ServingPlatform,
    kinds: &'static [Capability],
    model_kind: Option<Capability>,
}

/// Built-in platforms, in the order auto detection tries them.
const PLATFORMS: &[PlatformKinds] = &[
    PlatformKinds {
        platform: ServingPlatform::Kserve,
        kinds: &[INFERENCE_SERVICE],
        model_kind: Some(INFERENCE_SERVICE),
    },
    PlatformKinds {
        platform: ServingPlatform::OpenshiftAi,
        kinds: &[INFERENCE_SERVICE, SERVING_RUNTIME],
        model_kind: Some(INFERENCE_SERVICE),
    },
    PlatformKinds {
        platform: ServingPlatform::Vllm,
        kinds: &[],
        model_kind: None,
    },
    PlatformKinds {
        platform: ServingPlatform::Torchserve,
        kinds: &[],
        model_kind: None,
    },
    PlatformKinds {
        platform: ServingPlatform::TensorflowServing,
        kinds: &[],
        model_kind: None,
    },
    PlatformKinds {
        platform: ServingPlatform::Triton,
        kinds: &[],
        model_kind: None,
    },
    PlatformKinds {
        platform: ServingPlatform::RayServe,
        kinds: &[RAY_SERVICE, RAY_CLUSTER],
        model_kind: Some(RAY_SERVICE),
    },
    PlatformKinds {
        platform: ServingPlatform::Seldon,
        kinds: &[SELDON_DEPLOYMENT],
        model_kind: Some(SELDON_DEPLOYMENT),
    },
    PlatformKinds {
        platform: ServingPlatform::Bentoml,
        kinds: &[BENTO, BENTO_DEPLOYMENT],
        model_kind: Some(BENTO_DEPLOYMENT),
    },
];

fn definition(platform: ServingPlatform) -> Option<&'static PlatformKinds> {
    PLATFORMS.iter().find(|d| d.platform == platform)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// `None` when auto detection found nothing
    pub platform: Option<ServingPlatform>,
    pub detected: bool,
    pub served: Vec<Capability>,
    pub available: bool,
}

impl PlatformInfo {
    pub fn name(&self) -> &'static str {
        self.platform.map_or("unknown", ServingPlatform::as_str)
    }
}

async fn served_kinds<C: Cluster>(
    cluster: &C,
    kinds: &[Capability],
) -> Result<Vec<Capability>, ClusterError> {
    let mut served = Vec::new();
    for kind in kinds {
        if cluster.discover(kind).await? {
            served.push(*kind);
        }
    }
    Ok(served)
}

/// Finds the platform to check: the named one, or the first built-in one the cluster serves.
pub async fn detect<C: Cluster>(
    cluster: &C,
    hint: Option<ServingPlatform>,
) -> Result<PlatformInfo, ClusterError> {
    let Some(platform) = hint else {
        for definition in PLATFORMS.iter().filter(|d| !d.kinds.is_empty()) {
            let served = served_kinds(cluster, definition.kinds).await?;
            if !served.is_empty() {
                debug!("Detected serving platform {}", definition.platform);
                return Ok(PlatformInfo {
                    platform: Some(definition.platform),
                    detected: true,
                    served,
                    available: true,
                });
            }
        }
        return Ok(PlatformInfo {
            platform: None,
            detected: false,
            served: Vec::new(),
            available: false,
        });
    };

    let kinds = definition(platform).map_or(&[][..], |d| d.kinds);
    let served = served_kinds(cluster, kinds).await?;
    Ok(PlatformInfo {
        platform: Some(platform),
        detected: false,
        available: kinds.is_empty() || !served.is_empty(),
        served,
    })
}

/// Names of the built-in platforms whose API kinds the cluster serves.
pub async fn available_platforms<C: Cluster>(cluster: &C) -> Vec<&'static str> {
    let mut available = Vec::new();
    for definition in PLATFORMS.iter().filter(|d| !d.kinds.is_empty()) {
        match served_kinds(cluster, definition.kinds).await {
            Ok(served) if !served.is_empty() => available.push(definition.platform.as_str()),
            Ok(_) => {}
            Err(e) => warn!("Looking up serving platform {} failed: {}", definition.platform, e),
        }
    }
    available
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub models: Vec<ModelRef>,
    pub errors: Vec<String>,
}

impl Resolution {
    /// Distinct namespaces of the resolved models, in first-seen order.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = Vec::new();
        for model in &self.models {
            if !namespaces.contains(&model.namespace.as_str()) {
                namespaces.push(&model.namespace);
            }
        }
        namespaces
    }

    pub fn error_message(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| {
            format!(
                "failed to resolve {} model reference(s): {}",
                self.errors.len(),
                self.errors.join("; ")
            )
        })
    }
}

/// Resolves `model` and `namespace/model` references. Models outside the job's namespace
/// are refused.
pub fn resolve_models(targets: &[String], namespace: &str) -> Resolution {
    let mut resolution = Resolution::default();
    for target in targets {
        let target = target.trim();
        let parts: Vec<&str> = target.split('/').collect();
        let (model_namespace, name) = match parts.as_slice() {
            [name] => (namespace, *name),
            [model_namespace, name] => (*model_namespace, *name),
            _ => {
                resolution.errors.push(format!(
                    "invalid model reference '{target}', expected 'model' or 'namespace/model'"
                ));
                continue;
            }
        };
        if model_namespace.is_empty() || name.is_empty() {
            resolution.errors.push(format!(
                "invalid model reference '{target}', expected 'model' or 'namespace/model'"
            ));
            continue;
        }
        if model_namespace != namespace {
            resolution.errors.push(format!(
                "model '{target}' is in namespace '{model_namespace}', only models in '{namespace}' can be validated"
            ));
            continue;
        }
        resolution.models.push(ModelRef {
            namespace: model_namespace.to_string(),
            name: name.to_string(),
        });
    }
    resolution
}

/// A serving object counts as ready on a `Ready=True` condition or a running state field.
fn is_ready(object: &DynamicObject) -> bool {
    let Some(status) = object.data.get("status") else {
        return false;
    };
    let ready_condition = status
        .get("conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        });
    let running_state = ["state", "serviceStatus"].iter().any(|field| {
        matches!(
            status.get(field).and_then(Value::as_str),
            Some("Available" | "Running")
        )
    });
    ready_condition || running_state
}

/// Problems with the target models, one line each.
async fn check_models<C: Cluster>(
    cluster: &C,
    kind: &Capability,
    models: &[ModelRef],
) -> Result<Vec<String>, ClusterError> {
    let resource = kind.api_resource();
    let mut by_namespace: BTreeMap<&str, Vec<DynamicObject>> = BTreeMap::new();
    let mut problems = Vec::new();
    for model in models {
        if !by_namespace.contains_key(model.namespace.as_str()) {
            let objects = cluster
                .list(&resource, &model.namespace, &BTreeMap::new())
                .await?;
            by_namespace.insert(model.namespace.as_str(), objects);
        }
        let found = by_namespace
            .get(model.namespace.as_str())
            .and_then(|objects| objects.iter().find(|o| o.name_any() == model.name));
        match found {
            None => problems.push(format!("{}: {} not found", model, kind.kind)),
            Some(object) if !is_ready(object) => {
                problems.push(format!("{}: {} not ready", model, kind.kind))
            }
            Some(_) => {}
        }
    }
    Ok(problems)
}

/// Checks the serving platform and the target models before the notebook runs.
///
/// The outcome is advisory: every finding lands in the returned result. Only API failures
/// are errors.
#[instrument("serving/validate", skip(cluster, spec))]
pub async fn validate_models<C: Cluster>(
    cluster: &C,
    spec: &ModelValidationSpec,
    namespace: &str,
) -> Result<ModelValidationResult, ClusterError> {
    let info = detect(cluster, spec.platform).await?;
    let mut result = ModelValidationResult {
        phase: spec.phase.as_str().to_string(),
        platform: info.name().to_string(),
        platform_detected: info.detected,
        crds_installed: info
            .served
            .iter()
            .map(|kind| format!("{}.{}", kind.plural, kind.group))
            .collect(),
        success: false,
        message: None,
    };

    if !info.available {
        result.message = Some(match info.platform {
            Some(platform) => format!("serving platform {platform} is not installed in the cluster"),
            None => "no model serving platform detected in the cluster".to_string(),
        });
        return Ok(result);
    }

    let mut problems = Vec::new();
    let mut checked = 0;
    if spec.phase.checks_models() && !spec.target_models.is_empty() {
        let resolution = resolve_models(&spec.target_models, namespace);
        problems.extend(resolution.error_message());
        match info.platform.and_then(definition).and_then(|d| d.model_kind) {
            Some(kind) => {
                problems.extend(check_models(cluster, &kind, &resolution.models).await?);
                checked = resolution.models.len();
            }
            None => debug!(
                "Serving platform {} has no model resource, leaving model checks to the pod",
                result.platform
            ),
        }
    }

    result.success = problems.is_empty();
    result.message = Some(if !result.success {
        problems.join("; ")
    } else if checked > 0 {
        format!("serving platform {} available, {checked} model(s) ready", result.platform)
    } else {
        format!("serving platform {} available", result.platform)
    });
    Ok(result)
}
