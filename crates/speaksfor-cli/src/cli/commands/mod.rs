pub mod create;
pub mod keyid;
pub mod verify;

use anyhow::Result;
use speaksfor_core::SpeaksForConfig;

use super::args::{Cli, Command, GlobalArgs};

pub fn dispatch(cli: Cli) -> i32 {
    match cli.cmd {
        Command::Create(args) => create::cmd_create(&cli.global, args),
        Command::Verify(args) => verify::cmd_verify(&cli.global, args),
        Command::Keyid(args) => keyid::cmd_keyid(args),
    }
}

/// Configuration file or environment, with command-line overrides applied.
pub(crate) fn load_config(global: &GlobalArgs) -> Result<SpeaksForConfig> {
    let mut config = match &global.config {
        Some(path) => SpeaksForConfig::from_file(path)?,
        None => SpeaksForConfig::from_env(),
    };
    if let Some(path) = &global.xmlsec1 {
        config = config.with_xmlsec1_path(path);
    }
    if let Some(secs) = global.timeout_secs {
        config = config.with_timeout_secs(secs);
    }
    config.validate()?;
    Ok(config)
}
