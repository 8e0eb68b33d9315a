//! `speaksfor verify` - Verify a speaks-for credential.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use speaksfor_core::{Certificate, SpeaksForVerifier, TrustedRoots, VerificationReport, Xmlsec1};

use super::load_config;
use crate::cli::args::GlobalArgs;
use crate::exit_codes;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Signed credential file (XML)
    pub credential: PathBuf,

    /// Certificate of the tool claiming to speak for the user
    #[arg(long)]
    pub tool_cert: PathBuf,

    /// URN of the user the tool speaks for
    #[arg(long)]
    pub user_urn: String,

    /// Directory of trusted root certificates (defaults to SPEAKSFOR_TRUSTED_ROOTS)
    #[arg(long)]
    pub trusted_roots: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, conflicts_with = "quiet")]
    pub json: bool,

    /// Quiet mode - only exit code, no output
    #[arg(long, short)]
    pub quiet: bool,
}

#[derive(Serialize)]
struct VerifyOutput {
    #[serde(flatten)]
    result: VerificationReport,
    /// URN the tool acts as after speaks-for selection.
    effective_urn: Option<String>,
}

pub fn cmd_verify(global: &GlobalArgs, args: VerifyArgs) -> i32 {
    match run_verify(global, &args) {
        Ok(code) => code,
        Err(e) => {
            if !args.quiet {
                eprintln!("error: {e:#}");
            }
            exit_codes::for_error(&e)
        }
    }
}

fn run_verify(global: &GlobalArgs, args: &VerifyArgs) -> Result<i32> {
    let config = load_config(global)?;

    let document = std::fs::read(&args.credential)
        .with_context(|| format!("failed to read credential: {}", args.credential.display()))?;
    let tool_cert = Certificate::load(&args.tool_cert)
        .with_context(|| format!("failed to load tool certificate: {}", args.tool_cert.display()))?;

    let roots_dir = args
        .trusted_roots
        .clone()
        .or_else(|| config.trusted_roots_dir.clone())
        .context("no trusted roots: pass --trusted-roots or set SPEAKSFOR_TRUSTED_ROOTS")?;
    let roots = TrustedRoots::from_directory(&roots_dir)?;

    let verifier = SpeaksForVerifier::new(Xmlsec1::from_config(&config), roots);
    let result = verifier.verify(&document, &tool_cert, &args.user_urn);

    // With a single candidate, selection picks the verified user or falls
    // back to the tool itself.
    let effective = result.user_cert().unwrap_or(&tool_cert);

    let output = VerifyOutput {
        result: result.report(),
        effective_urn: effective.subject_urn(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet {
        if output.result.valid {
            println!("Verification successful!");
            println!();
            println!("  user:      {}", output.result.user_urn.as_deref().unwrap_or("-"));
            println!("  key_id:    {}", output.result.user_key_id.as_deref().unwrap_or("-"));
        } else {
            println!("Verification failed: {}", output.result.reason);
        }
        println!(
            "  acting as: {}",
            output.effective_urn.as_deref().unwrap_or("-")
        );
    }

    Ok(result
        .failure_kind()
        .map_or(exit_codes::SUCCESS, |kind| kind.exit_code()))
}
