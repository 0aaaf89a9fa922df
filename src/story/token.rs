use thiserror::Error;

pub const TOKEN_STRING: char = '"';
pub const TOKEN_ARRAY_START: char = '[';
pub const TOKEN_ARRAY_END: char = ']';
pub const TOKEN_SPACE: char = ' ';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("expected '{0}' but reached end of line")]
    Missing(char),

    #[error("unterminated token, expected closing '{0}'")]
    Unterminated(char),

    #[error("nested or escaped '{0}' is not supported")]
    Nested(char),
}

enum Scan<'a> {
    Token(&'a str),
    /// End of line reached before the closing delimiter.
    Partial(&'a str),
    Missing,
}

/// Reads delimited tokens from a single step line.
///
/// A token is whatever lies between an optional `start` delimiter and an `end`
/// delimiter, with those delimiter characters trimmed. Bare tokens (delimited by
/// spaces) are also trimmed of surrounding whitespace; quoted strings are kept
/// verbatim.
#[derive(Debug, Clone)]
pub struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Unconsumed remainder of the line.
    pub fn remaining(&self) -> &'a str {
        self.rest
    }

    pub fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Skips past `start` (when given), then reads up to and including `end`.
    pub fn read_token(&mut self, start: Option<char>, end: char) -> Result<&'a str, TokenError> {
        match self.scan(start, end)? {
            Scan::Token(token) => Ok(token),
            Scan::Partial(_) => Err(TokenError::Unterminated(end)),
            Scan::Missing => Err(TokenError::Missing(start.unwrap_or(end))),
        }
    }

    /// Like [`Tokenizer::read_token`], for the last optional field of a line.
    ///
    /// Reaching the end of the line is tolerated: a missing or empty field is
    /// `None`, and a bare token may be terminated by the end of the line.
    pub fn read_trailing(
        &mut self,
        start: Option<char>,
        end: char,
    ) -> Result<Option<&'a str>, TokenError> {
        let token = match self.scan(start, end)? {
            Scan::Token(token) => token,
            Scan::Missing => return Ok(None),
            Scan::Partial(partial) if partial.is_empty() => return Ok(None),
            Scan::Partial(partial) if end == TOKEN_SPACE => partial,
            Scan::Partial(_) => return Err(TokenError::Unterminated(end)),
        };
        Ok(Some(token).filter(|t| !t.is_empty()))
    }

    fn scan(&mut self, start: Option<char>, end: char) -> Result<Scan<'a>, TokenError> {
        if let Some(start) = start {
            match self.rest.find(start) {
                Some(i) => self.rest = &self.rest[i + start.len_utf8()..],
                None => {
                    self.rest = "";
                    return Ok(Scan::Missing);
                }
            }
        }

        let Some(i) = self.rest.find(end) else {
            let partial = trim(self.rest, start, end);
            self.rest = "";
            return Ok(Scan::Partial(partial));
        };
        let raw = &self.rest[..i];
        self.rest = &self.rest[i + end.len_utf8()..];

        if start == Some(TOKEN_ARRAY_START) && raw.contains(TOKEN_ARRAY_START) {
            return Err(TokenError::Nested(TOKEN_ARRAY_START));
        }
        // An enclosed token must be followed by whitespace or the end of the line.
        if start.is_some_and(|s| s != TOKEN_SPACE)
            && self.rest.chars().next().is_some_and(|c| !c.is_whitespace())
        {
            return Err(TokenError::Nested(end));
        }

        Ok(Scan::Token(trim(raw, start, end)))
    }
}

fn trim(raw: &str, start: Option<char>, end: char) -> &str {
    let token = raw.trim_matches(|c| Some(c) == start || c == end);
    if end == TOKEN_SPACE { token.trim() } else { token }
}

/// Splits the content of an array token into its comma-separated entries.
///
/// An empty array has no entries; entries are trimmed of whitespace.
pub fn split_array(token: &str) -> Vec<&str> {
    if token.trim().is_empty() {
        return Vec::new();
    }
    token.split(',').map(str::trim).collect()
}
