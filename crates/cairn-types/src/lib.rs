pub mod error;
pub mod mac;
pub mod resource;
