//! Two-member rooms created from matched pairs

mod manager;
mod types;

pub use manager::RoomManager;
pub use types::{AckOutcome, CloseReason, ClosedRoom, Room, RoomError, RoomState, RoomStats};
