//! TCP sessions between peers

mod connection;
pub mod events;
pub mod framing;
pub mod server;

#[cfg(test)]
mod tests;

pub use connection::Session;
pub use events::{DisconnectReason, SessionEvent};
pub use framing::{write_message, EnvelopeReader};
pub use server::SessionManager;
