pub mod handler;
pub mod manager;
pub mod mapping;
pub mod router;

pub use router::Gateway;
