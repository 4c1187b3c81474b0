mod handler;
mod message;

pub use handler::{client_ip, handle_client_message, ws_handler, WsQuery};
pub use message::{ClientMessage, IdentifyTab, OutboundMessage, ServerMessage};
