use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};

use super::labels::{Component, JobLabels};
use super::notebook_validation_job::{ModelValidationSpec, NotebookValidationJob};
use crate::config::ExecutionSettings;
use crate::serving::resolve_models;

pub const VALIDATOR_CONTAINER: &str = "validator";
pub const GIT_CLONE_CONTAINER: &str = "git-clone";

/// Printed by the validator right before the JSON result document.
pub const RESULTS_MARKER: &str = "Results Summary:";

const WORKSPACE: &str = "/workspace";
const CLONED_REPO: &str = "/workspace/repo";
const BUILT_SOURCE: &str = "/opt/app-root/src";

const CLONE_SCRIPT: &str = r#"set -eu
export GIT_TERMINAL_PROMPT=0
git config --global credential.helper ""
if [ -n "${GIT_USERNAME:-}" ] && [ -n "${GIT_PASSWORD:-}" ]; then
  git config --global credential.helper '!f() { echo "username=${GIT_USERNAME}"; echo "password=${GIT_PASSWORD}"; }; f'
fi
echo "Cloning repository at ref ${GIT_REF}"
git clone --depth 1 --branch "${GIT_REF}" "${GIT_URL}" /workspace/repo
if [ ! -f "/workspace/repo/${NOTEBOOK_PATH}" ]; then
  echo "ERROR: Notebook not found at path: ${NOTEBOOK_PATH}"
  exit 1
fi
echo "Notebook found"
"#;

const VALIDATE_SCRIPT: &str = r#"#!/bin/bash
OUTPUT=/workspace/output.ipynb
STATUS=succeeded
ERROR=""

echo "Input notebook: ${NOTEBOOK_INPUT}"
if [ ! -f "${NOTEBOOK_INPUT}" ]; then
  echo "ERROR: Notebook not found at path: ${NOTEBOOK_INPUT}"
  STATUS=failed
  ERROR="Notebook not found at path: ${NOTEBOOK_INPUT}"
else
  if ! python -c "import papermill" 2>/dev/null; then
    echo "Installing papermill"
    pip install --user --no-cache-dir papermill nbformat || {
      echo "ERROR: failed to install papermill"
      exit 2
    }
  fi
  python -m papermill "${NOTEBOOK_INPUT}" "${OUTPUT}" --log-output 2>&1 | tee /workspace/execution.log
  CODE=${PIPESTATUS[0]}
  if [ "${CODE}" -ne 0 ]; then
    STATUS=failed
    ERROR="Papermill execution failed with exit code ${CODE}"
    if grep -q "ModuleNotFoundError\|ImportError\|No module named" /workspace/execution.log; then
      ERROR="Notebook execution failed due to missing Python dependencies"
    elif grep -q "PermissionError\|Permission denied" /workspace/execution.log; then
      ERROR="Notebook execution failed due to permission errors"
    fi
  fi
fi

export STATUS ERROR OUTPUT
python3 - <<'PYTHON'
import json
import os

status = os.environ["STATUS"]
error = os.environ["ERROR"]
source = os.environ["OUTPUT"] if os.path.exists(os.environ["OUTPUT"]) else os.environ["NOTEBOOK_INPUT"]
cells = []
try:
    with open(source) as f:
        notebook = json.load(f)
    for index, cell in enumerate(notebook.get("cells", [])):
        entry = {"cell_index": index, "cell_type": cell.get("cell_type")}
        if cell.get("cell_type") == "code":
            errors = [o for o in cell.get("outputs", []) if o.get("output_type") == "error"]
            entry["status"] = "failed" if errors else "succeeded"
            if errors:
                entry["error"] = errors[0].get("evalue", "Unknown error")
                entry["traceback"] = errors[0].get("traceback", [])
        cells.append(entry)
except Exception as exc:
    if not error:
        status = "failed"
        error = "Could not read notebook: %s" % exc

code = [c for c in cells if c["cell_type"] == "code"]
failed = [c for c in code if c.get("status") == "failed"]
rate = round((len(code) - len(failed)) / len(code) * 100, 2) if code else 100.0
print("Results Summary:")
print(json.dumps({
    "status": status,
    "error": error,
    "notebook_path": os.environ.get("NOTEBOOK_PATH", ""),
    "cells": cells,
    "statistics": {
        "total_cells": len(cells),
        "code_cells": len(code),
        "failed_cells": len(failed),
        "success_rate": rate,
    },
}, indent=2))
PYTHON
"#;

/// Inputs for one validation attempt.
#[derive(Debug, Clone)]
pub struct PodRequest<'a> {
    pub job: &'a NotebookValidationJob,
    pub labels: &'a JobLabels,
    pub image: &'a str,
    /// The image came out of a build and already contains the repository.
    pub built_image: bool,
    pub attempt: u32,
    pub timeout: Duration,
    /// Serving platform the controller checked, if model validation ran
    pub serving_platform: Option<&'a str>,
}

pub fn pod_name(owner: &str, attempt: u32) -> String {
    format!("{owner}-validation-{attempt}")
}

/// Where the validator finds the notebook inside its container.
pub fn notebook_location(notebook_path: &str, built_image: bool) -> String {
    let root = if built_image { BUILT_SOURCE } else { CLONED_REPO };
    format!("{}/{}", root, notebook_path.trim_start_matches("./").trim_start_matches('/'))
}

fn restricted_security_context() -> Value {
    json!({
        "runAsNonRoot": true,
        "allowPrivilegeEscalation": false,
        "capabilities": { "drop": ["ALL"] },
        "seccompProfile": { "type": "RuntimeDefault" },
    })
}

fn clone_container(request: &PodRequest<'_>, settings: &ExecutionSettings) -> Value {
    let git = &request.job.spec.notebook.git;
    let mut env = vec![
        json!({ "name": "HOME", "value": "/tmp" }),
        json!({ "name": "GIT_URL", "value": git.url }),
        json!({ "name": "GIT_REF", "value": git.git_ref }),
        json!({ "name": "NOTEBOOK_PATH", "value": request.job.spec.notebook.path }),
    ];
    if let Some(secret) = &git.credentials_secret {
        for (name, key) in [("GIT_USERNAME", "username"), ("GIT_PASSWORD", "password")] {
            env.push(json!({
                "name": name,
                "valueFrom": {
                    "secretKeyRef": { "name": secret, "key": key, "optional": true },
                },
            }));
        }
    }
    json!({
        "name": GIT_CLONE_CONTAINER,
        "image": settings.git_clone_image,
        "command": ["/bin/sh", "-c", CLONE_SCRIPT],
        "env": env,
        "volumeMounts": [{ "name": "workspace", "mountPath": WORKSPACE }],
        "securityContext": restricted_security_context(),
    })
}

fn env_var(name: &str, value: &str) -> Value {
    json!({ "name": name, "value": value })
}

/// `MODEL_VALIDATION_*` settings for the validator. Only models in the job's namespace are
/// passed on.
fn model_validation_env(model: &ModelValidationSpec, namespace: &str, platform: &str) -> Vec<Value> {
    let mut env = vec![
        env_var("MODEL_VALIDATION_ENABLED", "true"),
        env_var("MODEL_VALIDATION_PLATFORM", platform),
        env_var("MODEL_VALIDATION_NAMESPACE", namespace),
        env_var("MODEL_VALIDATION_PHASE", model.phase.as_str()),
        env_var("MODEL_VALIDATION_TIMEOUT", &model.timeout),
    ];

    if !model.target_models.is_empty() {
        let resolution = resolve_models(&model.target_models, namespace);
        let resolved: Vec<String> = resolution.models.iter().map(ToString::to_string).collect();
        env.push(env_var("MODEL_VALIDATION_TARGET_MODELS", &resolved.join(",")));
        env.push(env_var(
            "MODEL_VALIDATION_TARGET_MODELS_ORIGINAL",
            &model.target_models.join(","),
        ));
        env.push(env_var(
            "MODEL_VALIDATION_TARGET_NAMESPACES",
            &resolution.namespaces().join(","),
        ));
    }

    if let Some(prediction) = model.prediction_validation.as_ref().filter(|p| p.enabled) {
        env.push(env_var("MODEL_VALIDATION_PREDICTION_ENABLED", "true"));
        if let Some(data) = &prediction.test_data {
            env.push(env_var("MODEL_VALIDATION_PREDICTION_TEST_DATA", data));
        }
        if let Some(expected) = &prediction.expected_output {
            env.push(env_var("MODEL_VALIDATION_PREDICTION_EXPECTED_OUTPUT", expected));
        }
        env.push(env_var(
            "MODEL_VALIDATION_PREDICTION_TOLERANCE",
            &prediction.tolerance,
        ));
    }

    if let Some(custom) = &model.custom_platform {
        for (name, value) in [
            ("MODEL_VALIDATION_CUSTOM_API_GROUP", &custom.api_group),
            ("MODEL_VALIDATION_CUSTOM_RESOURCE_TYPE", &custom.resource_type),
            ("MODEL_VALIDATION_CUSTOM_HEALTH_ENDPOINT", &custom.health_check_endpoint),
            ("MODEL_VALIDATION_CUSTOM_PREDICTION_ENDPOINT", &custom.prediction_endpoint),
        ] {
            if let Some(value) = value {
                env.push(env_var(name, value));
            }
        }
    }
    env
}

fn validator_container(request: &PodRequest<'_>) -> Result<Value, serde_json::Error> {
    let pod_config = &request.job.spec.pod_config;

    let mut env = vec![
        json!({ "name": "HOME", "value": WORKSPACE }),
        json!({ "name": "PYTHONUSERBASE", "value": format!("{WORKSPACE}/.local") }),
        json!({ "name": "NOTEBOOK_PATH", "value": request.job.spec.notebook.path }),
        json!({
            "name": "NOTEBOOK_INPUT",
            "value": notebook_location(&request.job.spec.notebook.path, request.built_image),
        }),
    ];
    // user env comes last so it can override any of these
    if let Some(model) = request.job.enabled_model_validation() {
        let platform = request
            .serving_platform
            .or(model.platform.map(|p| p.as_str()))
            .unwrap_or("auto");
        let namespace = request.job.namespace().unwrap_or_default();
        env.extend(model_validation_env(model, &namespace, platform));
    }
    env.extend(
        pod_config
            .env
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?,
    );

    let mut env_from = pod_config
        .env_from
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    env_from.extend(
        pod_config
            .credentials
            .iter()
            .map(|secret| json!({ "secretRef": { "name": secret } })),
    );

    let mut container = json!({
        "name": VALIDATOR_CONTAINER,
        "image": request.image,
        "command": ["/bin/bash", "-c", VALIDATE_SCRIPT],
        "env": env,
        "envFrom": env_from,
        "volumeMounts": [{ "name": "workspace", "mountPath": WORKSPACE }],
        "securityContext": restricted_security_context(),
    });
    if let Some(resources) = &pod_config.resources {
        container["resources"] = serde_json::to_value(resources)?;
    }
    Ok(container)
}

/// The pod running one validation attempt.
pub fn validation_pod(
    request: &PodRequest<'_>,
    settings: &ExecutionSettings,
) -> Result<Pod, serde_json::Error> {
    let owner_references: Vec<_> = request.job.controller_owner_ref(&()).into_iter().collect();
    let init_containers: Vec<Value> = if request.built_image {
        Vec::new()
    } else {
        vec![clone_container(request, settings)]
    };
    let service_account = request
        .job
        .spec
        .pod_config
        .service_account_name
        .as_deref()
        .filter(|sa| !sa.is_empty())
        .unwrap_or(&settings.service_account);

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name(&request.job.name_any(), request.attempt),
            "namespace": request.labels.namespace,
            "labels": request.labels.labels(Component::Validation),
            "ownerReferences": owner_references,
        },
        "spec": {
            "restartPolicy": "Never",
            "activeDeadlineSeconds": request.timeout.as_secs().max(1),
            "serviceAccountName": service_account,
            "initContainers": init_containers,
            "containers": [validator_container(request)?],
            "volumes": [{ "name": "workspace", "emptyDir": {} }],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes_objects::notebook_validation_job::{
        EnvFromSource, EnvVar, EnvVarSource, KeySelector, NamedRef, NotebookValidationJobSpec,
        ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn job() -> NotebookValidationJob {
        let spec: NotebookValidationJobSpec = serde_yaml::from_str(
            r#"
            notebook:
              git:
                url: https://github.com/org/notebooks.git
                ref: v2
                credentialsSecret: git-creds
              path: notebooks/train.ipynb
            podConfig:
              containerImage: quay.io/jupyter/scipy-notebook:latest
              credentials: [aws-creds]
            "#,
        )
        .unwrap();
        let mut job = NotebookValidationJob::new("train", spec);
        job.metadata.namespace = Some("ml".into());
        job.metadata.uid = Some("uid-1".into());
        job
    }

    fn labels(job: &NotebookValidationJob) -> JobLabels {
        JobLabels::for_job(job)
    }

    #[test]
    fn test_notebook_location() {
        assert_eq!(
            notebook_location("notebooks/train.ipynb", false),
            "/workspace/repo/notebooks/train.ipynb"
        );
        assert_eq!(
            notebook_location("./train.ipynb", true),
            "/opt/app-root/src/train.ipynb"
        );
    }

    #[test]
    fn test_pod_with_supplied_image_clones_repository() {
        let mut job = job();
        job.spec.pod_config.env = vec![EnvVar {
            name: "TOKEN".into(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(KeySelector {
                    name: "api".into(),
                    key: "token".into(),
                }),
                config_map_key_ref: None,
            }),
        }];
        job.spec.pod_config.env_from = vec![EnvFromSource {
            secret_ref: None,
            config_map_ref: Some(NamedRef {
                name: "settings".into(),
            }),
        }];
        job.spec.pod_config.resources = Some(ResourceRequirements {
            limits: BTreeMap::from([("memory".to_string(), "2Gi".to_string())]),
            requests: BTreeMap::new(),
        });
        let labels = labels(&job);
        let request = PodRequest {
            job: &job,
            labels: &labels,
            image: "quay.io/jupyter/scipy-notebook:latest",
            built_image: false,
            attempt: 2,
            timeout: Duration::from_secs(1800),
            serving_platform: None,
        };

        let pod = validation_pod(&request, &ExecutionSettings::default()).unwrap();
        assert_eq!(pod.name_any(), "train-validation-2");
        assert_eq!(pod.labels(), &labels.labels(Component::Validation));

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.active_deadline_seconds, Some(1800));
        assert_eq!(
            spec.service_account_name.as_deref(),
            Some("jupyter-notebook-validator-runner")
        );

        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, GIT_CLONE_CONTAINER);
        let init_env = init[0].env.as_ref().unwrap();
        assert!(init_env.iter().any(|e| e.name == "GIT_PASSWORD"));

        let validator = &spec.containers[0];
        assert_eq!(validator.name, VALIDATOR_CONTAINER);
        let env = validator.env.as_ref().unwrap();
        let input = env.iter().find(|e| e.name == "NOTEBOOK_INPUT").unwrap();
        assert_eq!(
            input.value.as_deref(),
            Some("/workspace/repo/notebooks/train.ipynb")
        );
        assert!(env.iter().any(|e| e.name == "TOKEN" && e.value_from.is_some()));
        assert_eq!(validator.env_from.as_ref().unwrap().len(), 2);
        assert_eq!(
            validator.resources.as_ref().unwrap().limits.as_ref().unwrap()["memory"],
            Quantity("2Gi".into())
        );

        let security = validator.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(security.allow_privilege_escalation, Some(false));
        assert_eq!(
            security.seccomp_profile.as_ref().unwrap().type_,
            "RuntimeDefault"
        );
    }

    #[test]
    fn test_pod_with_built_image_skips_clone() {
        let mut job = job();
        job.spec.pod_config.service_account_name = Some("custom-sa".into());
        let labels = labels(&job);
        let request = PodRequest {
            job: &job,
            labels: &labels,
            image: "image-registry.openshift-image-registry.svc:5000/ml/train-build@sha256:1",
            built_image: true,
            attempt: 1,
            timeout: Duration::from_secs(600),
            serving_platform: None,
        };

        let pod = validation_pod(&request, &ExecutionSettings::default()).unwrap();
        let spec = pod.spec.unwrap();
        assert!(spec.init_containers.unwrap_or_default().is_empty());
        assert_eq!(spec.service_account_name.as_deref(), Some("custom-sa"));
        assert_eq!(spec.containers[0].image.as_deref(), Some(request.image));
        let env = spec.containers[0].env.as_ref().unwrap();
        let input = env.iter().find(|e| e.name == "NOTEBOOK_INPUT").unwrap();
        assert_eq!(
            input.value.as_deref(),
            Some("/opt/app-root/src/notebooks/train.ipynb")
        );
    }

    #[test]
    fn test_scripts_print_results_marker() {
        assert!(VALIDATE_SCRIPT.contains(RESULTS_MARKER));
        assert!(CLONE_SCRIPT.contains("/workspace/repo"));
    }

    #[test]
    fn test_model_validation_env_precedes_user_env() {
        let mut job = job();
        job.spec.model_validation = serde_yaml::from_str(
            r#"
            platform: kserve
            phase: existing
            targetModels: [fraud, other/churn]
            predictionValidation:
              testData: '{"instances": [[1, 2]]}'
            customPlatform:
              healthCheckEndpoint: /healthz
            "#,
        )
        .unwrap();
        job.spec.pod_config.env = vec![EnvVar {
            name: "MODEL_VALIDATION_TIMEOUT".into(),
            value: Some("10m".into()),
            value_from: None,
        }];
        let labels = labels(&job);
        let request = PodRequest {
            job: &job,
            labels: &labels,
            image: "quay.io/jupyter/scipy-notebook:latest",
            built_image: false,
            attempt: 1,
            timeout: Duration::from_secs(600),
            serving_platform: Some("kserve"),
        };

        let pod = validation_pod(&request, &ExecutionSettings::default()).unwrap();
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let value = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(value("MODEL_VALIDATION_ENABLED").as_deref(), Some("true"));
        assert_eq!(value("MODEL_VALIDATION_PLATFORM").as_deref(), Some("kserve"));
        assert_eq!(value("MODEL_VALIDATION_NAMESPACE").as_deref(), Some("ml"));
        assert_eq!(value("MODEL_VALIDATION_PHASE").as_deref(), Some("existing"));
        assert_eq!(value("MODEL_VALIDATION_TARGET_MODELS").as_deref(), Some("ml/fraud"));
        assert_eq!(
            value("MODEL_VALIDATION_TARGET_MODELS_ORIGINAL").as_deref(),
            Some("fraud,other/churn")
        );
        assert_eq!(value("MODEL_VALIDATION_TARGET_NAMESPACES").as_deref(), Some("ml"));
        assert_eq!(value("MODEL_VALIDATION_PREDICTION_TOLERANCE").as_deref(), Some("0.01"));
        assert_eq!(
            value("MODEL_VALIDATION_CUSTOM_HEALTH_ENDPOINT").as_deref(),
            Some("/healthz")
        );
        assert_eq!(value("MODEL_VALIDATION_PREDICTION_EXPECTED_OUTPUT"), None);

        let timeouts: Vec<_> = env
            .iter()
            .filter(|e| e.name == "MODEL_VALIDATION_TIMEOUT")
            .filter_map(|e| e.value.as_deref())
            .collect();
        assert_eq!(timeouts, vec!["5m", "10m"]);
    }

    #[test]
    fn test_disabled_model_validation_adds_no_env() {
        let mut job = job();
        job.spec.model_validation = serde_yaml::from_str("enabled: false").unwrap();
        let labels = labels(&job);
        let request = PodRequest {
            job: &job,
            labels: &labels,
            image: "quay.io/jupyter/scipy-notebook:latest",
            built_image: false,
            attempt: 1,
            timeout: Duration::from_secs(600),
            serving_platform: None,
        };

        let pod = validation_pod(&request, &ExecutionSettings::default()).unwrap();
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(!env.iter().any(|e| e.name.starts_with("MODEL_VALIDATION_")));
    }
}
