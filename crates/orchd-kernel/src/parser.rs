//! Command-line parsing: shell-like tokens, pipe-separated stages.
//!
//! The grammar is deliberately small:
//!
//! - whitespace separates tokens;
//! - single quotes preserve everything up to the closing quote;
//! - double quotes group words and let `\\` and `\"` escape;
//! - outside quotes, `\ ` escapes a single space; `\\` and `\"` also
//!   escape; any other `\x` keeps both characters;
//! - an unquoted `|` ends the current stage.
//!
//! Quotes toggle *inside* a word — `a"b c"d` is the single token `ab cd` —
//! and an empty quoted string is a real (empty) argument, so tokenization
//! walks the input character by character instead of splitting on
//! delimiters.

use thiserror::Error;

use crate::task::Program;

/// Why a command line failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("trailing backslash")]
    TrailingBackslash,

    #[error("pipeline stage has no command")]
    EmptyStage,

    #[error("command must be a single program, but contains a pipe")]
    PipelineNotAllowed,
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
}

/// Scan the next token starting at `pos`, advancing `pos` past it.
///
/// `Ok(None)` is the end of input. A `|` that terminates a pending word is
/// left unconsumed so the next call returns it as its own token.
fn next_token(chars: &[char], pos: &mut usize) -> Result<Option<Token>, ParseError> {
    let mut in_single = false;
    let mut in_double = false;
    let mut seen_quotes = false;
    let mut word = String::new();

    while *pos < chars.len() {
        let c = chars[*pos];
        match c {
            '"' if !in_single => {
                seen_quotes = true;
                in_double = !in_double;
                *pos += 1;
            }
            '\'' if !in_double => {
                seen_quotes = true;
                in_single = !in_single;
                *pos += 1;
            }
            '\\' if !in_single => {
                *pos += 1;
                match chars.get(*pos).copied() {
                    None => return Err(ParseError::TrailingBackslash),
                    Some(next) => {
                        if next == '\\' || next == '"' || (!in_double && next == ' ') {
                            word.push(next);
                        } else {
                            // Unknown escape: keep both characters.
                            word.push('\\');
                            word.push(next);
                        }
                        *pos += 1;
                    }
                }
            }
            ' ' | '\t' if !in_single && !in_double => {
                *pos += 1;
                if !word.is_empty() || seen_quotes {
                    return Ok(Some(Token::Word(word)));
                }
            }
            '|' if !in_single && !in_double => {
                if !word.is_empty() || seen_quotes {
                    // Leave the pipe for the next call.
                    return Ok(Some(Token::Word(word)));
                }
                *pos += 1;
                return Ok(Some(Token::Pipe));
            }
            _ => {
                word.push(c);
                *pos += 1;
            }
        }
    }

    if in_single || in_double {
        return Err(ParseError::UnterminatedQuote);
    }
    if !word.is_empty() || seen_quotes {
        Ok(Some(Token::Word(word)))
    } else {
        Ok(None)
    }
}

/// Parse a command line into a pipeline of programs (length ≥ 1).
pub fn parse_pipeline(command_line: &str) -> Result<Vec<Program>, ParseError> {
    let chars: Vec<char> = command_line.chars().collect();
    let mut pos = 0;

    let mut stages = Vec::new();
    let mut current: Vec<String> = Vec::new();

    while let Some(token) = next_token(&chars, &mut pos)? {
        match token {
            Token::Word(w) => current.push(w),
            Token::Pipe => {
                if current.is_empty() {
                    return Err(ParseError::EmptyStage);
                }
                stages.push(Program::new(std::mem::take(&mut current)));
            }
        }
    }

    if current.is_empty() {
        return Err(ParseError::EmptyStage);
    }
    stages.push(Program::new(current));
    Ok(stages)
}

/// Parse a command line that must be a single program (no pipes).
pub fn parse_single(command_line: &str) -> Result<Program, ParseError> {
    let mut pipeline = parse_pipeline(command_line)?;
    if pipeline.len() != 1 {
        return Err(ParseError::PipelineNotAllowed);
    }
    Ok(pipeline.remove(0))
}
