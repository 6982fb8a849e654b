//! Controller metrics.
//!
//! Handlers report through an injected [`MetricsSink`]; nothing here is process global.
//! [`TracingMetrics`] turns every sample into a structured event on the `metrics` target,
//! which an exporter can pick up from the subscriber.

use std::time::Duration;

use tracing::info;

use crate::kubernetes_objects::notebook_validation_job::{JobPhase, Reason};

pub const PHASE_TRANSITIONS: &str = "notebook_validator_phase_transitions_total";
pub const BUILDS_CREATED: &str = "notebook_validator_builds_created_total";
pub const BUILDS_FINISHED: &str = "notebook_validator_builds_finished_total";
pub const RETRIES_SCHEDULED: &str = "notebook_validator_retries_scheduled_total";
pub const POD_FAILURES: &str = "notebook_validator_pod_failures_total";
pub const VALIDATIONS_FINISHED: &str = "notebook_validator_validations_finished_total";
pub const RECONCILE_DURATION: &str = "notebook_validator_reconcile_duration_seconds";
pub const MODEL_VALIDATIONS: &str = "notebook_validator_model_validations_total";

pub trait MetricsSink: Send + Sync {
    fn phase_transition(&self, namespace: &str, from: JobPhase, to: JobPhase);
    fn build_created(&self, namespace: &str, strategy: &str);
    fn build_finished(&self, namespace: &str, strategy: &str, succeeded: bool);
    fn retry_scheduled(&self, namespace: &str, reason: Reason);
    fn pod_failure(&self, namespace: &str, reason: &str);
    fn validation_finished(&self, namespace: &str, succeeded: bool);
    fn reconcile_duration(&self, phase: JobPhase, elapsed: Duration);
    fn model_validation(&self, namespace: &str, platform: &str, succeeded: bool);
}

/// Discards every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn phase_transition(&self, _: &str, _: JobPhase, _: JobPhase) {}
    fn build_created(&self, _: &str, _: &str) {}
    fn build_finished(&self, _: &str, _: &str, _: bool) {}
    fn retry_scheduled(&self, _: &str, _: Reason) {}
    fn pod_failure(&self, _: &str, _: &str) {}
    fn validation_finished(&self, _: &str, _: bool) {}
    fn reconcile_duration(&self, _: JobPhase, _: Duration) {}
    fn model_validation(&self, _: &str, _: &str, _: bool) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn phase_transition(&self, namespace: &str, from: JobPhase, to: JobPhase) {
        info!(target: "metrics", metric = PHASE_TRANSITIONS, namespace, from = %from, to = %to, value = 1u64);
    }

    fn build_created(&self, namespace: &str, strategy: &str) {
        info!(target: "metrics", metric = BUILDS_CREATED, namespace, strategy, value = 1u64);
    }

    fn build_finished(&self, namespace: &str, strategy: &str, succeeded: bool) {
        let result = if succeeded { "succeeded" } else { "failed" };
        info!(target: "metrics", metric = BUILDS_FINISHED, namespace, strategy, result, value = 1u64);
    }

    fn retry_scheduled(&self, namespace: &str, reason: Reason) {
        info!(target: "metrics", metric = RETRIES_SCHEDULED, namespace, reason = ?reason, value = 1u64);
    }

    fn pod_failure(&self, namespace: &str, reason: &str) {
        info!(target: "metrics", metric = POD_FAILURES, namespace, reason, value = 1u64);
    }

    fn validation_finished(&self, namespace: &str, succeeded: bool) {
        let result = if succeeded { "succeeded" } else { "failed" };
        info!(target: "metrics", metric = VALIDATIONS_FINISHED, namespace, result, value = 1u64);
    }

    fn reconcile_duration(&self, phase: JobPhase, elapsed: Duration) {
        info!(target: "metrics", metric = RECONCILE_DURATION, phase = %phase, value = elapsed.as_secs_f64());
    }

    fn model_validation(&self, namespace: &str, platform: &str, succeeded: bool) {
        let result = if succeeded { "succeeded" } else { "failed" };
        info!(target: "metrics", metric = MODEL_VALIDATIONS, namespace, platform, result, value = 1u64);
    }
}
