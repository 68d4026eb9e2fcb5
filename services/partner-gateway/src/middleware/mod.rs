pub mod client_auth;

pub use client_auth::{AuthenticatedClient, ClientAuth};
