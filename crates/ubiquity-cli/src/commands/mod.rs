//! Command handlers

pub mod cloud;
pub mod config;
pub mod record;
pub mod status;

use std::io::{self, Write};

use anyhow::Result;

use crate::output::Output;

/// Ask for confirmation on a terminal
///
/// `yes` skips the prompt. Without a terminal, or in JSON or quiet mode,
/// the answer is no.
pub fn confirm(prompt: &str, yes: bool, output: &Output) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !output.should_prompt() || !atty::is(atty::Stream::Stdin) {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}
