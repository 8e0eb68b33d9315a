//! `speaksfor create` - Issue a speaks-for credential.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use speaksfor_core::{SpeaksForIssuer, Xmlsec1};

use super::load_config;
use crate::cli::args::GlobalArgs;
use crate::exit_codes;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Certificate of the tool that will speak for the user
    #[arg(long)]
    pub tool_cert: PathBuf,

    /// User certificate
    #[arg(long)]
    pub user_cert: PathBuf,

    /// User private key (PEM)
    #[arg(long)]
    pub user_key: PathBuf,

    /// Certificate of the authority that issued the user certificate
    #[arg(long)]
    pub ma_cert: PathBuf,

    /// Output credential file
    #[arg(long, short)]
    pub out: PathBuf,

    /// Quiet mode - only exit code, no output
    #[arg(long, short)]
    pub quiet: bool,
}

pub fn cmd_create(global: &GlobalArgs, args: CreateArgs) -> i32 {
    match run_create(global, &args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            if !args.quiet {
                eprintln!("error: {e:#}");
            }
            exit_codes::for_error(&e)
        }
    }
}

fn run_create(global: &GlobalArgs, args: &CreateArgs) -> Result<()> {
    let config = load_config(global)?;
    let issuer = SpeaksForIssuer::from_config(Xmlsec1::from_config(&config), &config)?;

    issuer.create_speaks_for(
        &args.tool_cert,
        &args.user_cert,
        &args.user_key,
        &args.ma_cert,
        &args.out,
    )?;

    if !args.quiet {
        println!("Wrote speaks-for credential to {}", args.out.display());
    }
    Ok(())
}
