#![cfg_attr(not(test), deny(unsafe_code))]
#![warn(
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::missing_docs_in_private_items
)]

//! Shared HTTP client abstractions for AI provider clients
//!
//! Provider crates describe each API operation as an [`Endpoint`] and hand it to a
//! [`RequestBuilder`], which owns authentication, JSON and multipart bodies, SSE
//! streaming and the mapping of non-success responses onto [`CommonRequestError`].

pub mod error;
pub mod request_builder;
pub mod streaming;

pub use error::{CommonRequestError, ErrorKind};
pub use request_builder::{
    AuthMethod, Endpoint, HttpMethod, MultipartForm, RequestBuilder, RequestConfig,
    StreamOptions,
};
pub use streaming::SseParser;

/// Re-export common types for convenience
pub use async_trait::async_trait;
pub use futures_util::stream::BoxStream;
