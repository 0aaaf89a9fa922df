//! CLI utilities for pg-stories.
//!
//! Helpers shared by the binaries for reading commands from a user.
use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, or end of input
    Exit,
    /// Frontend message line, e.g. `Q "SELECT 1"`
    Step(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
    #[error("prompt IO error: {0}")]
    Io(#[from] io::Error),
}

/// Prompt user for a REPL command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Command::Exit),
        s if !s.starts_with('.') => Ok(Command::Step(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}
