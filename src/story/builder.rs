use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use log::debug;
use thiserror::Error;

use crate::protocol::{BackendMessage, FrontendMessage, MessageKind, ObjectType};

use super::{
    Step, Story,
    token::{
        TOKEN_ARRAY_END, TOKEN_ARRAY_START, TOKEN_SPACE, TOKEN_STRING, TokenError, Tokenizer,
        split_array,
    },
};

pub const TOKEN_BACKEND_MESSAGE: &str = "<-";
pub const TOKEN_FRONTEND_MESSAGE: &str = "->";
pub const TOKEN_STORY_DELIMITER: &str = "===";

/// List of possible errors raised while parsing stories.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(char),

    #[error("invalid argument count for message of type: {0}")]
    InvalidArgCount(char),

    #[error("invalid argument in message of type: {code}, {reason}")]
    InvalidArg { code: char, reason: String },

    #[error("invalid token in message of type: {code}, {source}")]
    Token {
        code: char,
        #[source]
        source: TokenError,
    },

    #[error("unexpected token {actual} at line #{line}. expected one of {}", .expected.join("/"))]
    UnexpectedToken {
        line: usize,
        expected: Vec<&'static str>,
        actual: String,
    },

    #[error("invalid direction '{0}'. expected one of ->/<-")]
    InvalidDirection(String),

    #[error("story is empty")]
    EmptyStory,

    #[error("story '{0}' is not closed with '==='")]
    UnterminatedStory(String),

    #[error("empty step definition")]
    EmptyStep,

    #[error("invalid step definition")]
    InvalidStep,

    #[error("line #{line}: {source}")]
    AtLine {
        line: usize,
        #[source]
        source: Box<ParseError>,
    },

    #[error("failed to read stories: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    fn token(code: char) -> impl Fn(TokenError) -> ParseError {
        move |source| match source {
            TokenError::Missing(_) => ParseError::InvalidArgCount(code),
            source => ParseError::Token { code, source },
        }
    }

    fn invalid(code: char, reason: impl Into<String>) -> ParseError {
        ParseError::InvalidArg {
            code,
            reason: reason.into(),
        }
    }
}

fn quoted<'a>(tokens: &mut Tokenizer<'a>, code: char) -> Result<&'a str, ParseError> {
    tokens
        .read_token(Some(TOKEN_STRING), TOKEN_STRING)
        .map_err(ParseError::token(code))
}

fn array<'a>(tokens: &mut Tokenizer<'a>, code: char) -> Result<Vec<&'a str>, ParseError> {
    let token = tokens
        .read_token(Some(TOKEN_ARRAY_START), TOKEN_ARRAY_END)
        .map_err(ParseError::token(code))?;
    let entries = split_array(token);
    if entries.iter().any(|e| e.is_empty()) {
        return Err(ParseError::invalid(code, "array entries cannot be empty"));
    }
    Ok(entries)
}

/// Encodes a Bind parameter: numbers become the little-endian bits of an `f64`,
/// anything else is sent as its text.
fn bind_parameter(raw: &str) -> Vec<u8> {
    match raw.parse::<f64>() {
        Ok(value) => value.to_bits().to_le_bytes().to_vec(),
        Err(_) => raw.as_bytes().to_vec(),
    }
}

/// Builds the frontend message for a `->` step from its type code and fields.
pub fn parse_command(code: char, tokens: &mut Tokenizer) -> Result<FrontendMessage, ParseError> {
    let msg = match code {
        'B' => {
            let destination_portal = quoted(tokens, code)?.to_string();
            let prepared_statement = quoted(tokens, code)?.to_string();
            let parameters = array(tokens, code)?
                .into_iter()
                .map(bind_parameter)
                .collect();
            FrontendMessage::Bind {
                destination_portal,
                prepared_statement,
                parameters,
            }
        }
        'C' => FrontendMessage::Close {
            object_type: ObjectType::Statement,
            name: String::new(),
        },
        'D' => {
            tokens.skip_whitespace();
            let target = tokens
                .read_trailing(None, TOKEN_SPACE)
                .map_err(ParseError::token(code))?
                .ok_or(ParseError::InvalidArgCount(code))?;
            let object_type = match target {
                "S" => ObjectType::Statement,
                "P" => ObjectType::Portal,
                other => {
                    return Err(ParseError::invalid(
                        code,
                        format!("describe target must be S or P, got '{other}'"),
                    ));
                }
            };
            let name = tokens
                .read_trailing(Some(TOKEN_STRING), TOKEN_STRING)
                .map_err(ParseError::token(code))?
                .unwrap_or_default()
                .to_string();
            FrontendMessage::Describe { object_type, name }
        }
        'E' => {
            let portal = quoted(tokens, code)?.to_string();
            tokens.skip_whitespace();
            let max_rows = match tokens
                .read_trailing(None, TOKEN_SPACE)
                .map_err(ParseError::token(code))?
            {
                Some(raw) => raw.parse::<u32>().map_err(|e| {
                    ParseError::invalid(code, format!("max rows '{raw}' is not a number: {e}"))
                })?,
                None => 0,
            };
            FrontendMessage::Execute { portal, max_rows }
        }
        'H' => FrontendMessage::Flush,
        'P' => {
            let name = quoted(tokens, code)?.to_string();
            let query = quoted(tokens, code)?.to_string();
            let parameter_oids = array(tokens, code)?
                .into_iter()
                .map(|raw| {
                    raw.parse::<u32>().map_err(|e| {
                        ParseError::invalid(code, format!("parameter oid '{raw}': {e}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            FrontendMessage::Parse {
                name,
                query,
                parameter_oids,
            }
        }
        'p' => FrontendMessage::PasswordMessage {
            password: String::new(),
        },
        'Q' => FrontendMessage::Query {
            query: quoted(tokens, code)?.to_string(),
        },
        'S' => FrontendMessage::Sync,
        'X' => FrontendMessage::Terminate,
        other => return Err(ParseError::UnknownMessageType(other)),
    };

    Ok(msg)
}

/// Builds the expected backend message for a `<-` step from its type code.
///
/// The code is the message's wire type tag; the result is a bare message of that
/// kind, used only as a comparison template.
pub fn parse_response(code: char) -> Result<BackendMessage, ParseError> {
    u8::try_from(code)
        .ok()
        .and_then(MessageKind::from_tag)
        .map(BackendMessage::empty)
        .ok_or(ParseError::UnknownMessageType(code))
}

/// Parses one standalone step line, e.g. `-> Q "SELECT 1"` or `<- Z`.
pub fn parse_step(line: &str) -> Result<Step, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::EmptyStep);
    }
    if line.len() < 4 {
        return Err(ParseError::InvalidStep);
    }

    let mut tokens = Tokenizer::new(line);
    let direction = tokens
        .read_token(None, TOKEN_SPACE)
        .map_err(|_| ParseError::InvalidStep)?;
    tokens.skip_whitespace();
    let code = tokens
        .read_trailing(None, TOKEN_SPACE)
        .map_err(|_| ParseError::InvalidStep)?
        .ok_or(ParseError::InvalidStep)?;

    let mut chars = code.chars();
    let (Some(code), None) = (chars.next(), chars.next()) else {
        return Err(ParseError::InvalidStep);
    };

    match direction {
        TOKEN_FRONTEND_MESSAGE => Ok(Step::Command(parse_command(code, &mut tokens)?)),
        TOKEN_BACKEND_MESSAGE => Ok(Step::Response(parse_response(code)?)),
        other => Err(ParseError::InvalidDirection(other.to_string())),
    }
}

/// Assembles stories from delimited blocks of step lines.
pub struct StoryBuilder<R: BufRead> {
    reader: R,
    startup: Vec<Step>,
    line: usize,
}

impl StoryBuilder<BufReader<File>> {
    /// Opens a story file.
    pub fn from_path(path: impl AsRef<Path>, startup: Vec<Step>) -> Result<Self, ParseError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), startup))
    }
}

impl<R: BufRead> StoryBuilder<R> {
    /// Every parsed story starts with a copy of `startup`.
    pub fn new(reader: R, startup: Vec<Step>) -> Self {
        Self {
            reader,
            startup,
            line: 0,
        }
    }

    /// Parses the next `===` block, or returns `None` once the input is exhausted.
    pub fn parse_next(&mut self) -> Result<Option<Story>, ParseError> {
        let mut open: Option<Story> = None;
        let mut buf = String::new();

        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                return match open {
                    None => Ok(None),
                    Some(story) => Err(ParseError::UnterminatedStory(story.name)),
                };
            }
            self.line += 1;

            let line = buf.trim();
            if line.is_empty() {
                continue;
            }

            let Some(mut story) = open.take() else {
                let Some(name) = line.strip_prefix(TOKEN_STORY_DELIMITER) else {
                    return Err(ParseError::UnexpectedToken {
                        line: self.line,
                        expected: vec![TOKEN_STORY_DELIMITER],
                        actual: line.chars().take(TOKEN_STORY_DELIMITER.len()).collect(),
                    });
                };
                open = Some(Story::new(name.trim(), self.startup.clone()));
                continue;
            };

            if line == TOKEN_STORY_DELIMITER {
                if story.steps.len() == self.startup.len() {
                    return Err(ParseError::EmptyStory);
                }
                debug!("parsed story '{}' ({} steps)", story.name, story.steps.len());
                return Ok(Some(story));
            }

            let step = parse_step(line).map_err(|e| ParseError::AtLine {
                line: self.line,
                source: Box::new(e),
            })?;
            story.steps.push(step);
            open = Some(story);
        }
    }
}

impl<R: BufRead> Iterator for StoryBuilder<R> {
    type Item = Result<Story, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parse_next().transpose()
    }
}
