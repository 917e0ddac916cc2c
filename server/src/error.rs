//! Error taxonomy for the coordination core.
//!
//! Protocol mistakes made by clients are not errors at this level: handlers answer them with
//! an explicit error message and return `Ok`. What reaches the hub as a [`GameError`] is one
//! of transport trouble (a queue that is full or gone), an encoding failure, or an
//! [`GameError::Invariant`] violation, which means the server itself is in a state it should
//! never reach.

use crate::client::ClientId;
use shared::MessageError;
use thiserror::Error;

pub type GameResult<T = ()> = Result<T, GameError>;

#[derive(Debug, Error)]
pub enum GameError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] MessageError),

    #[error("outbound queue for client {0} is full")]
    QueueFull(ClientId),

    #[error("connection for client {0} is closed")]
    ConnectionClosed(ClientId),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("{} errors: {}", .0.len(), display_all(.0))]
    Multiple(Vec<GameError>),
}

impl GameError {
    pub fn invariant(what: impl Into<String>) -> Self {
        GameError::Invariant(what.into())
    }

    /// True if this error, or any error it aggregates, is an invariant violation.
    pub fn is_invariant(&self) -> bool {
        match self {
            GameError::Invariant(_) => true,
            GameError::Multiple(errors) => errors.iter().any(GameError::is_invariant),
            _ => false,
        }
    }
}

fn display_all(errors: &[GameError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Combines independent results without short-circuiting.
///
/// Returns `Ok` if every result is `Ok`, the single error if exactly one failed, and
/// [`GameError::Multiple`] otherwise. Nested aggregates are flattened.
pub fn join_results<I>(results: I) -> GameResult
where
    I: IntoIterator<Item = GameResult>,
{
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(()) => {}
            Err(GameError::Multiple(inner)) => errors.extend(inner),
            Err(e) => errors.push(e),
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(GameError::Multiple(errors)),
    }
}
