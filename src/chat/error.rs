use uuid::Uuid;

use crate::rooms::RoomError;

/// Request-level refusals, reported to the client as `error {code, message}`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Connection {0} has not identified a tab")]
    NotIdentified(Uuid),

    #[error(transparent)]
    Room(#[from] RoomError),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotIdentified(_) => "NOT_IDENTIFIED",
            CoreError::Room(e) => e.code(),
        }
    }
}
