pub mod error;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod security;

pub use error::{ApiError, ApiResult};
pub use security::*;
