//! Debugger command-line tokenization: whitespace splitting with
//! double-quote and backslash escapes, and an optional trailing pipe.

use thiserror::Error;

/// A parsed debugger command: the command word, its arguments, and the shell command the
/// output should be piped to, if any.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandLine {
    pub command: String,
    pub args: Vec<String>,
    pub pipe: Option<String>,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CommandError {
    #[error("unterminated double quote")]
    UnterminatedQuote,
    #[error("trailing backslash")]
    TrailingEscape,
    #[error("empty command")]
    Empty,
    #[error("missing command after `|`")]
    EmptyPipe,
}

/// Splits a raw line into tokens. Double quotes group words; a backslash escapes the next
/// character both inside and outside quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>, CommandError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let Some(escaped) = chars.next() else {
                    return Err(CommandError::TrailingEscape);
                };
                current.push(escaped);
                in_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_quotes {
        return Err(CommandError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parses a token list into a [`CommandLine`]. A bare `|` token splits off the shell command
/// that the debugger command's output will be piped to.
pub fn parse(tokens: Vec<String>) -> Result<CommandLine, CommandError> {
    let mut iter = tokens.into_iter();
    let Some(command) = iter.next() else {
        return Err(CommandError::Empty);
    };
    if command == "|" {
        return Err(CommandError::Empty);
    }
    let mut args = Vec::new();
    let mut pipe_parts = Vec::new();
    let mut piping = false;
    for token in iter {
        if !piping && token == "|" {
            piping = true;
        } else if piping {
            pipe_parts.push(token);
        } else {
            args.push(token);
        }
    }
    if piping && pipe_parts.is_empty() {
        return Err(CommandError::EmptyPipe);
    }
    Ok(CommandLine {
        command,
        args,
        pipe: piping.then(|| pipe_parts.join(" ")),
    })
}

/// Convenience wrapper: tokenize then parse.
pub fn parse_line(line: &str) -> Result<CommandLine, CommandError> {
    parse(tokenize(line)?)
}
