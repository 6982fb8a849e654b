use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{BuildStrategy, PipelineStrategy, SourceBuildStrategy, Strategy, StrategyError};
use crate::cluster::{Capability, Cluster, ClusterError};
use crate::config::BuildSettings;
use crate::error::ErrorKind;
use crate::kubernetes_objects::notebook_validation_job::BuildConfigSpec;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("unknown build strategy '{name}', known strategies: {known}")]
    NotFound { name: String, known: String },

    #[error(transparent)]
    Invalid(StrategyError),

    #[error(
        "build strategy '{strategy}' is not available: missing {missing}; available alternatives: {alternatives}"
    )]
    Unavailable {
        strategy: &'static str,
        missing: String,
        alternatives: String,
    },

    #[error("no build strategy available ({attempted})")]
    NoneAvailable { attempted: String },

    #[error("capability discovery failed: {0}")]
    Discovery(#[from] ClusterError),
}

impl SelectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SelectionError::NotFound { .. } => ErrorKind::ConfigurationError,
            SelectionError::Invalid(e) => e.kind(),
            SelectionError::Unavailable { .. } | SelectionError::NoneAvailable { .. } => {
                ErrorKind::CapabilityUnavailable
            }
            SelectionError::Discovery(e) => e.kind(),
        }
    }
}

fn describe(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(Capability::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn or_none(list: String) -> String {
    if list.is_empty() { "none".to_string() } else { list }
}

/// Build strategies in priority order. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub(crate) struct StrategyRegistry {
    strategies: Vec<BuildStrategy>,
}

impl StrategyRegistry {
    pub fn new(settings: &BuildSettings) -> Self {
        StrategyRegistry {
            strategies: vec![
                BuildStrategy::SourceBuild(SourceBuildStrategy::new(settings.clone())),
                BuildStrategy::Pipeline(PipelineStrategy::new(settings.clone())),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&BuildStrategy> {
        self.strategies.iter().find(|s| s.name() == name)
    }

    pub fn strategies(&self) -> &[BuildStrategy] {
        &self.strategies
    }

    /// Names of the strategies whose capabilities the cluster serves.
    pub async fn available<C: Cluster>(&self, cluster: &C) -> Vec<&'static str> {
        let mut available = Vec::new();
        for strategy in &self.strategies {
            match strategy.detect(cluster).await {
                Ok(true) => available.push(strategy.name()),
                Ok(false) => {}
                Err(e) => warn!("Looking up build strategy {} failed: {}", strategy.name(), e),
            }
        }
        available
    }

    /// Resolves the strategy for a build config: the pinned one, or the first usable one.
    #[instrument("registry/select", skip(self, cluster, config), fields(strategy = %config.strategy))]
    pub async fn select<C: Cluster>(
        &self,
        cluster: &C,
        config: &BuildConfigSpec,
    ) -> Result<&BuildStrategy, SelectionError> {
        match config.pinned_strategy() {
            Some(name) => self.select_pinned(cluster, name, config).await,
            None => self.select_auto(cluster, config).await,
        }
    }

    async fn select_pinned<C: Cluster>(
        &self,
        cluster: &C,
        name: &str,
        config: &BuildConfigSpec,
    ) -> Result<&BuildStrategy, SelectionError> {
        let strategy = self.get(name).ok_or_else(|| SelectionError::NotFound {
            name: name.to_string(),
            known: self
                .strategies
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(", "),
        })?;
        strategy.validate(config).map_err(SelectionError::Invalid)?;

        let missing = strategy.missing_capabilities(cluster).await?;
        if !missing.is_empty() {
            let alternatives = self
                .available(cluster)
                .await
                .into_iter()
                .filter(|n| *n != strategy.name())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SelectionError::Unavailable {
                strategy: strategy.name(),
                missing: describe(&missing),
                alternatives: or_none(alternatives),
            });
        }
        Ok(strategy)
    }

    async fn select_auto<C: Cluster>(
        &self,
        cluster: &C,
        config: &BuildConfigSpec,
    ) -> Result<&BuildStrategy, SelectionError> {
        let mut attempted = Vec::new();
        for strategy in &self.strategies {
            match strategy.missing_capabilities(cluster).await {
                Ok(missing) if missing.is_empty() => match strategy.validate(config) {
                    Ok(()) => {
                        debug!("Selected build strategy {}", strategy.name());
                        return Ok(strategy);
                    }
                    Err(e) => attempted.push(format!("{}: {}", strategy.name(), e)),
                },
                Ok(missing) => {
                    attempted.push(format!("{}: missing {}", strategy.name(), describe(&missing)))
                }
                // lower priority strategies must not win because this lookup failed
                Err(e) => return Err(SelectionError::Discovery(e)),
            }
        }
        Err(SelectionError::NoneAvailable {
            attempted: attempted.join("; "),
        })
    }
}
