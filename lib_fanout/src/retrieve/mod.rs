//! # Data Retrieval Module
//!
//! HTTP collaborators of the identity gate, built on a shared `ApiClient`
//! with transient-failure retries.
//!
//! - **`api_client`**: generic JSON `ApiClient` over `reqwest-middleware`.
//! - **`accounts`**: `HttpAccountResolver` and `HttpIntrospector`.

pub mod accounts;
pub mod api_client;

pub use accounts::{HttpAccountResolver, HttpIntrospector};
pub use api_client::{ApiClient, ApiResponse};
