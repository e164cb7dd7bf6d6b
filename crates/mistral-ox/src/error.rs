pub use ai_ox_common::error::{CommonRequestError, ErrorKind};

/// Every client operation fails with the shared request error.
pub type MistralRequestError = CommonRequestError;
