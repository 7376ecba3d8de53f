pub mod auth;
pub mod cache;
pub mod chatrooms;
pub mod error;
pub mod middleware;
pub mod otp;
pub mod state;

pub use error::ApiError;
pub use state::{AppState, AppStateInner};
