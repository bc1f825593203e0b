//! Confirmation for destructive operations.

use crate::utils::errors::{BackupError, Result};
use std::io::{BufRead, Write};

/// Global `--dry-run`, `--yes` and `--force` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyOptions {
    pub dry_run: bool,
    pub yes: bool,
    pub force: bool,
}

/// Ask `question` on `output` and read the answer from `input`.
///
/// Dry runs are always declined without asking and `--yes` always
/// accepts. Only `y` or `yes` (any case) accept; anything else, including
/// end of input, declines.
pub fn confirm_with<R: BufRead, W: Write>(
    options: &SafetyOptions,
    input: &mut R,
    output: &mut W,
    question: &str,
) -> Result<bool> {
    if options.dry_run {
        return Ok(false);
    }
    if options.yes {
        return Ok(true);
    }
    write!(output, "{} [y/N]: ", question.trim())?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// [`confirm_with`] on the terminal: prompt on stderr, answer on stdin.
pub async fn confirm(options: &SafetyOptions, question: &str) -> Result<bool> {
    if options.dry_run || options.yes {
        return confirm_with(options, &mut std::io::empty(), &mut std::io::sink(), question);
    }
    let options = *options;
    let question = question.to_string();
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stderr();
        confirm_with(&options, &mut input, &mut output, &question)
    })
    .await
    .map_err(|e| BackupError::Transport(format!("confirmation prompt failed: {}", e)))?
}
