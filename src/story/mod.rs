//! Scripted protocol stories.
//!
//! A [`Story`] is a named, ordered script of [`Step`]s: frontend messages to send
//! ([`Step::Command`]) and backend messages to expect ([`Step::Response`]). Stories are
//! written in a small line-oriented notation, parsed by [`StoryBuilder`], and replayed
//! against a live connection by [`StoryRunner`].
//!
//! # Notation
//!
//! ```text
//! === bind after parse
//! -> P "" "SELECT * FROM (VALUES($1)) t;" [0]
//! -> B "" "" [baa]
//! -> E "" 0
//! -> S
//! <- 1
//! <- 2
//! <- D
//! <- C
//! <- Z
//! ===
//! ```
//!
//! Each block opens with `=== <name>` and closes with a bare `===`. Lines starting
//! with `->` are commands followed by a one-character message type and its fields;
//! lines starting with `<-` are expected responses identified by their message type
//! alone.
//!
//! # Example
//! ```rust
//! use pg_stories::story::{Step, StoryBuilder};
//! use pg_stories::protocol::{FrontendMessage, MessageKind};
//!
//! let text = "=== t\n-> Q \"SELECT 1\"\n<- Z\n===\n";
//! let story = StoryBuilder::new(text.as_bytes(), vec![])
//!     .parse_next()
//!     .unwrap()
//!     .unwrap();
//!
//! assert_eq!(story.name, "t");
//! assert_eq!(
//!     story.steps,
//!     vec![
//!         Step::Command(FrontendMessage::Query { query: "SELECT 1".into() }),
//!         Step::response(MessageKind::ReadyForQuery),
//!     ]
//! );
//! ```
//!
//! # See Also
//! - [`protocol`](crate::protocol): Codec the steps are sent and received through.
use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::protocol::{BackendMessage, ErrorFields, FrontendMessage, MessageKind};

mod builder;
mod runner;
mod token;

pub use builder::{ParseError, StoryBuilder, parse_command, parse_response, parse_step};
pub use runner::{RunError, RunnerConfig, StoryRunner};
pub use token::{TokenError, Tokenizer};

/// Callback invoked for every backend message received during a run.
///
/// Returns true when the message is terminal for the caller's purposes (for
/// example the ReadyForQuery that ends a REPL command). It does not take part in
/// comparison.
pub type Filter = Arc<dyn Fn(&BackendMessage) -> bool + Send + Sync>;

/// One scripted unit of a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Frontend message to transmit.
    Command(FrontendMessage),
    /// Template of the backend message expected next. Never transmitted.
    Response(BackendMessage),
}

impl Step {
    /// Expects any message of the given kind.
    pub fn response(kind: MessageKind) -> Self {
        Step::Response(BackendMessage::empty(kind))
    }

    /// Expects an ErrorResponse with the given SQLSTATE; an empty code accepts any.
    pub fn error_response(code: impl Into<String>) -> Self {
        Step::Response(BackendMessage::ErrorResponse(ErrorFields::with_code(code)))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("wrong type of message. expected: {expected}. got {actual}")]
    Kind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("expected error response with code: {expected}. got {actual}")]
    Code { expected: String, actual: String },
}

/// Checks a received message against an expected template.
///
/// The wire type tags must match. For error responses a non-empty expected SQLSTATE
/// must also match exactly. All other fields of the template are ignored.
pub fn compare(expected: &BackendMessage, actual: &BackendMessage) -> Result<(), Mismatch> {
    if expected.tag() != actual.tag() {
        return Err(Mismatch::Kind {
            expected: expected.kind(),
            actual: actual.kind(),
        });
    }

    if let (BackendMessage::ErrorResponse(want), BackendMessage::ErrorResponse(got)) =
        (expected, actual)
    {
        if !want.code().is_empty() && want.code() != got.code() {
            return Err(Mismatch::Code {
                expected: want.code().to_string(),
                actual: got.code().to_string(),
            });
        }
    }

    Ok(())
}

/// A named, ordered script of steps.
#[derive(Clone, Default)]
pub struct Story {
    pub name: String,
    pub steps: Vec<Step>,
    pub filter: Option<Filter>,
}

impl Story {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            filter: None,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&BackendMessage) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for Story {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Story")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_by_kind() {
        let expected = BackendMessage::empty(MessageKind::ReadyForQuery);
        let actual = BackendMessage::ReadyForQuery { status: b'T' };
        assert_eq!(compare(&expected, &actual), Ok(()));

        let actual = BackendMessage::ErrorResponse(ErrorFields::with_code("42601"));
        assert_eq!(
            compare(&expected, &actual),
            Err(Mismatch::Kind {
                expected: MessageKind::ReadyForQuery,
                actual: MessageKind::ErrorResponse,
            })
        );
    }

    #[test]
    fn compare_ignores_template_fields() {
        let expected = BackendMessage::CommandComplete {
            tag: "INSERT 0 1".into(),
        };
        let actual = BackendMessage::CommandComplete {
            tag: "SELECT 1".into(),
        };
        assert_eq!(compare(&expected, &actual), Ok(()));
    }

    #[test]
    fn compare_error_codes() {
        let actual = BackendMessage::ErrorResponse(ErrorFields::with_code("26000"));

        let Step::Response(any) = Step::error_response("") else {
            unreachable!()
        };
        assert_eq!(compare(&any, &actual), Ok(()));

        let Step::Response(exact) = Step::error_response("26000") else {
            unreachable!()
        };
        assert_eq!(compare(&exact, &actual), Ok(()));

        let Step::Response(other) = Step::error_response("42P01") else {
            unreachable!()
        };
        assert_eq!(
            compare(&other, &actual),
            Err(Mismatch::Code {
                expected: "42P01".into(),
                actual: "26000".into(),
            })
        );
    }

    #[test]
    fn story_debug_hides_filter() {
        let story =
            Story::new("t", vec![Step::Command(FrontendMessage::Sync)]).with_filter(|_| true);
        let out = format!("{story:?}");
        assert!(out.contains("filter: true"));
    }
}
