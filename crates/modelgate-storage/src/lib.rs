// Storage layer for the gateway
//
// `Database` is the single repository facade; row structs live in `models`.

pub mod api_key;
pub mod models;
pub mod repositories;

pub use api_key::{generate_api_key, hash_api_key, verify_api_key, GeneratedApiKey};
pub use repositories::Database;
