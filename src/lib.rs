use self::cli::{Cli, Command};
use self::error::SpannedErr;
use self::kubernetes_objects::notebook_validation_job::NotebookValidationJob;
use clap::Parser;
use kube::CustomResourceExt;
use thiserror::Error;
use tracing::info;
use tracing_error::ExtractSpanTrace;
use tracing_error::SpanTrace;

pub(crate) mod build;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub(crate) mod execution;
pub mod kubernetes_objects;
pub mod metrics;
pub(crate) mod reconciler;
pub mod retry;
pub mod sanitize;
pub(crate) mod serving;
pub mod shutdown;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to load config.\n{0}")]
    ConfigError(#[from] config::ConfigLoadError),

    #[error("Failed to initialize kubernetes client.\n{0}")]
    KubeClientError(#[from] kube::Error),

    #[error("Controller stopped due to following error:\n{0}")]
    ControllerError(#[from] SpannedErr<kube::Error>),

    #[error("Failed to render the CustomResourceDefinition.\n{0}")]
    CrdError(#[from] serde_yaml::Error),
}

impl ExtractSpanTrace for AppError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            AppError::ControllerError(e) => e.span_trace(),
            _ => None,
        }
    }
}

pub async fn app() -> Result<(), AppError> {
    let cli = Cli::parse();

    if let Command::Crd {} = cli.command {
        print!("{}", serde_yaml::to_string(&NotebookValidationJob::crd())?);
        return Ok(());
    }

    let config = config::Config::new_from_file(&cli.config).await?;

    info!("Config Loaded.");

    let client = kube::Client::try_default().await?;

    info!("Kubernetes Client Initialized.");

    match cli.command {
        Command::Run {} => reconciler::run(config, client).await?,
        Command::Crd {} => {}
    }

    Ok(())
}
