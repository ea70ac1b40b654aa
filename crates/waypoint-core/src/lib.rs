pub mod account;
pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod traits;
pub mod types;

pub use account::{AccountSource, ConnectedAccount};
pub use config::AppConfig;
pub use error::{Result, WaypointError};
pub use event::EventBus;
pub use session::*;
pub use types::*;
