//! Matchmaking queue
//!
//! Interest-aware FIFO pairing, one queue per chat modality.

mod interests;
mod queue;

pub use interests::{normalize_interests, normalize_with, shared_interests, Interests};
pub use queue::{EnqueueOutcome, MatchPair, MatchQueue, TicketInfo, WaitingTicket};
