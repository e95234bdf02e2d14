use crate::utils::error::Result;
use crate::utils::validation::{validate_non_empty_string, validate_path, Validate};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "capability-orchestrator")]
#[command(about = "Apply a capability manifest to an account")]
pub struct CliConfig {
    #[arg(long, short = 'c', help = "Orchestrator TOML config")]
    pub config: Option<String>,

    #[arg(long, short = 'm', help = "Capability manifest (TOML)")]
    pub manifest: String,

    #[arg(long, default_value = "default")]
    pub account: String,

    #[arg(long, help = "Run the apply job inline instead of in the background")]
    pub sync: bool,

    #[arg(long, help = "Only print the leveled plan")]
    pub dry_run: bool,

    #[arg(long, short = 'v', help = "Enable verbose output")]
    pub verbose: bool,
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        validate_path("manifest", &self.manifest)?;
        if let Some(config) = &self.config {
            validate_path("config", config)?;
        }
        validate_non_empty_string("account", &self.account)
    }
}
