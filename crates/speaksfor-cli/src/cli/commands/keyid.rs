//! `speaksfor keyid` - Show the key identity of a certificate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use speaksfor_core::Certificate;

use crate::exit_codes;

#[derive(Args, Debug)]
pub struct KeyIdArgs {
    /// Certificate file (PEM or DER)
    pub cert: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct KeyIdReport {
    key_id: String,
    urn: Option<String>,
    subject: String,
    is_ca: bool,
}

pub fn cmd_keyid(args: KeyIdArgs) -> i32 {
    match run_keyid(&args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::for_error(&e)
        }
    }
}

fn run_keyid(args: &KeyIdArgs) -> Result<()> {
    let cert = Certificate::load(&args.cert)
        .with_context(|| format!("failed to load certificate: {}", args.cert.display()))?;

    let report = KeyIdReport {
        key_id: cert.key_id().to_hex(),
        urn: cert.subject_urn(),
        subject: cert.subject().to_string(),
        is_ca: cert.is_ca(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.key_id);
        println!("  subject: {}", report.subject);
        if let Some(urn) = &report.urn {
            println!("  urn:     {urn}");
        }
    }
    Ok(())
}
