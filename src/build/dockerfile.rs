//! Build file generation for the pipeline strategy.
//!
//! The repository is only visible inside the pipeline, so the decision chain runs as a shell
//! step: custom build file, then a dependency manifest, then an existing
//! `Dockerfile`/`Containerfile`, then the base image alone as the missing-manifest policy allows.

use crate::config::AutoFallback;
use crate::kubernetes_objects::notebook_validation_job::FallbackPolicy;

/// What the step does when no dependency manifest is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingManifest {
    Skip,
    Warn,
    Fail,
}

impl MissingManifest {
    pub fn resolve(policy: FallbackPolicy, auto: AutoFallback) -> Self {
        match (policy, auto) {
            (FallbackPolicy::Warn, _) => MissingManifest::Warn,
            (FallbackPolicy::Fail, _) | (FallbackPolicy::Auto, AutoFallback::Fail) => {
                MissingManifest::Fail
            }
            (FallbackPolicy::Auto, AutoFallback::Skip) => MissingManifest::Skip,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MissingManifest::Skip => "skip",
            MissingManifest::Warn => "warn",
            MissingManifest::Fail => "fail",
        }
    }
}

/// Directory of the notebook inside the repository, `.` for the root.
pub fn notebook_dir(notebook_path: &str) -> &str {
    match notebook_path.trim_start_matches("./").rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => ".",
    }
}

pub const GENERATE_SCRIPT: &str = r#"#!/usr/bin/env bash
set -eu
cd "$(workspaces.source.path)"

BASE_IMAGE="$(params.BASE_IMAGE)"
DOCKERFILE_PATH="$(params.DOCKERFILE_PATH)"
REQUIREMENTS_FILE="$(params.REQUIREMENTS_FILE)"
NOTEBOOK_DIR="$(params.NOTEBOOK_DIR)"
MISSING_MANIFEST="$(params.MISSING_MANIFEST)"

if [ -n "$DOCKERFILE_PATH" ]; then
  if [ ! -f "$DOCKERFILE_PATH" ]; then
    echo "ERROR: custom build file $DOCKERFILE_PATH not found" >&2
    exit 1
  fi
  [ "$DOCKERFILE_PATH" = "Dockerfile" ] || cp "$DOCKERFILE_PATH" Dockerfile
  echo "Using custom build file $DOCKERFILE_PATH"
  exit 0
fi

MANIFEST=""
for candidate in "$REQUIREMENTS_FILE" "$NOTEBOOK_DIR/requirements.txt" notebooks/requirements.txt requirements.txt; do
  if [ -n "$candidate" ] && [ -f "$candidate" ]; then
    MANIFEST="$candidate"
    break
  fi
done

if [ -z "$MANIFEST" ]; then
  for existing in Dockerfile Containerfile; do
    if [ -f "$existing" ]; then
      [ "$existing" = "Dockerfile" ] || cp "$existing" Dockerfile
      echo "Using existing $existing"
      exit 0
    fi
  done
  case "$MISSING_MANIFEST" in
    fail)
      echo "ERROR: no dependency manifest found" >&2
      exit 1
      ;;
    warn)
      echo "WARNING: no dependency manifest found, building without dependency installation"
      ;;
  esac
fi

{
  echo "FROM $BASE_IMAGE"
  echo "RUN pip install --no-cache-dir papermill nbformat"
  if [ -n "$MANIFEST" ]; then
    echo "COPY $MANIFEST /tmp/requirements.txt"
    echo "RUN pip install --no-cache-dir -r /tmp/requirements.txt"
  fi
  echo "COPY . /opt/app-root/src/"
  echo "WORKDIR /opt/app-root/src"
} > Dockerfile

echo "Generated Dockerfile:"
cat Dockerfile
"#;
