use std::fmt::Display;

use tracing_error::{ExtractSpanTrace, SpanTrace};

use crate::kubernetes_objects::labels::Component;
use crate::kubernetes_objects::notebook_validation_job::Reason;
use crate::sanitize::truncate_diagnostic;

#[derive(Debug)]
pub struct SpannedErr<T> {
    pub err: T,
    pub span_trace: SpanTrace,
}

pub trait SpannedExt<T, E> {
    fn with_span_trace(self) -> Result<T, SpannedErr<E>>;
}

impl<T, E> SpannedExt<T, E> for Result<T, E> {
    fn with_span_trace(self) -> Result<T, SpannedErr<E>> {
        self.map_err(|e| SpannedErr {
            err: e,
            span_trace: SpanTrace::capture(),
        })
    }
}

impl<E> ExtractSpanTrace for SpannedErr<E> {
    fn span_trace(&self) -> Option<&SpanTrace> {
        Some(&self.span_trace)
    }
}

impl<T: Display> Display for SpannedErr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl<U: std::error::Error> std::error::Error for SpannedErr<U> {}

/// Failure taxonomy shared by every phase handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad spec or missing required field. Never retried.
    ConfigurationError,
    /// A required cluster capability is absent.
    CapabilityUnavailable,
    /// Infrastructure hiccup. Retried without deleting anything.
    TransientInfra,
    /// The build or pod failed and a fresh attempt may succeed.
    RetriableExecutionFailure,
    /// Out of memory or unschedulable. Retried, reported distinctly.
    ResourceExhaustion,
    /// Known to never self-heal.
    TerminalExecutionFailure,
}

impl ErrorKind {
    pub fn reason(self) -> Reason {
        match self {
            ErrorKind::ConfigurationError => Reason::ConfigurationError,
            ErrorKind::CapabilityUnavailable => Reason::CapabilityUnavailable,
            ErrorKind::TransientInfra => Reason::TransientInfra,
            ErrorKind::RetriableExecutionFailure => Reason::RetriableExecutionFailure,
            ErrorKind::ResourceExhaustion => Reason::ResourceExhaustion,
            ErrorKind::TerminalExecutionFailure => Reason::TerminalExecutionFailure,
        }
    }
}

/// A classified failure raised by a phase handler, waiting for a retry decision.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub reason: Reason,
    pub message: String,
    pub detail: Option<String>,
    /// Child resource to delete before a retriable attempt is repeated.
    pub component: Option<Component>,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: kind.reason(),
            message: message.into(),
            detail: None,
            component: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_detail(mut self, detail: impl AsRef<str>) -> Self {
        let detail = detail.as_ref().trim();
        if !detail.is_empty() {
            self.detail = Some(truncate_diagnostic(detail));
        }
        self
    }

    pub fn on(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    /// Human facing text: the primary message, then truncated diagnostics.
    pub fn user_message(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}. Details: {}", self.message, detail),
            None => self.message.clone(),
        }
    }
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
