use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::commands::{create::CreateArgs, keyid::KeyIdArgs, verify::VerifyArgs};

#[derive(Parser, Debug)]
#[command(
    name = "speaksfor",
    version,
    about = "Create and verify ABAC speaks-for credentials"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// YAML configuration file (defaults to SPEAKSFOR_* environment variables)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the xmlsec1 binary
    #[arg(long, global = true)]
    pub xmlsec1: Option<PathBuf>,

    /// Timeout for each xmlsec1 call, in seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a credential letting a tool speak for a user
    Create(CreateArgs),

    /// Verify a speaks-for credential and report the effective identity
    Verify(VerifyArgs),

    /// Print the key identity and URN of a certificate
    Keyid(KeyIdArgs),
}
