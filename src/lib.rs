//! Client-side core of the EcoSwap conversation screen: the message log with
//! optimistic sends, counterpart presence, the proposal negotiation state
//! machine and the session that drives them over REST and a realtime channel.

pub mod api;
pub mod auth;
pub mod bus;
pub mod chat;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod message_store;
pub mod participant;
pub mod presence;
pub mod proposal;
pub mod realtime;
pub mod scroll;
pub mod session;

pub use error::{Result, SessionError};
pub use manager::SessionRegistry;
pub use session::{ConnectionState, SessionController, SessionDeps};
