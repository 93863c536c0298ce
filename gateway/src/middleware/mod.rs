pub mod auth;

pub use auth::{Auth, auth_middleware, match_api_key_id};
