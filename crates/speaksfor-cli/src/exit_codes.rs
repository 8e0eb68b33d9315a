//! Exit codes of the `speaksfor` binary.
//! Credential failures map through `FailureKind::exit_code` (1 to 5); these are the fixed points.

use speaksfor_core::SpeaksForError;

pub const SUCCESS: i32 = 0;
pub const INVALID_INPUT: i32 = 1; // Unreadable or malformed input
pub const IO_ERROR: i32 = 5; // xmlsec1, temp files, filesystem
pub const CONFIG_ERROR: i32 = 6;

/// Exit code for a failed command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<SpeaksForError>() {
        return e.exit_code();
    }
    if err.chain().any(|cause| cause.is::<std::io::Error>()) {
        return IO_ERROR;
    }
    INVALID_INPUT
}
