pub mod oauth;
pub mod refresh_task;
pub mod store;
pub mod token_manager;
pub mod types;

pub use store::Vault;
pub use token_manager::{Grant, TokenManager};
