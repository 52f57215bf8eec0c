pub mod manager;
pub mod refresher;
pub mod types;

pub use manager::AccountPool;
