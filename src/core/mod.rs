// Core domain layer
pub mod interfaces;
pub mod models;

pub use interfaces::*;
pub use models::*;
