pub mod auth;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod keyed;
pub mod presence;
pub mod reactions;
pub mod rooms;
pub mod store;
pub mod typing;

pub use error::{HubError, HubResult};
pub use hub::{Hub, HubConfig, Session};
