//! Request middleware.

pub mod auth;
pub mod pipeline;

pub use auth::{AdminPrincipal, Principal, ROLE_ADMIN, resolve_principal};
pub use pipeline::{HEADER_LIMIT, HEADER_REMAINING, request_pipeline};
