pub mod sender;
pub mod server;
pub mod session;

pub use server::{ServerOptions, WebsocketServer};
