use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "notebook-validator", version, about)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) command: Command,

    #[clap(
        short,
        long,
        default_value = "/etc/notebook-validator/config.yaml",
        global = true
    )]
    pub(crate) config: PathBuf,
}

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum Command {
    /// Run the controller until SIGINT or SIGTERM
    Run {},
    /// Print the NotebookValidationJob CustomResourceDefinition as YAML
    Crd {},
}
