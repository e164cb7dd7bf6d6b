use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use derive_more::Display;
use thiserror::Error;

use crate::{
    Mistral,
    error::MistralRequestError,
    request::{ClassificationRequest, EmbeddingsRequest, ModerationRequest, TextInput},
    response::{ClassificationResult, ModerationResult},
};

/// One HTTP round trip for one chunk of work items.
///
/// Implementations return exactly one output per input item, in input order.
#[async_trait]
pub trait EndpointInvoker: Send + Sync + 'static {
    type Item: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    async fn invoke(
        &self,
        model: &str,
        items: &[Self::Item],
    ) -> Result<Vec<Self::Output>, InvokeError>;
}

#[async_trait]
impl<T: EndpointInvoker> EndpointInvoker for Arc<T> {
    type Item = T::Item;
    type Output = T::Output;

    async fn invoke(
        &self,
        model: &str,
        items: &[Self::Item],
    ) -> Result<Vec<Self::Output>, InvokeError> {
        self.as_ref().invoke(model, items).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InvokeErrorKind {
    /// Worth retrying: rate limits, timeouts, 5xx
    #[display("transient")]
    Transient,
    #[display("permanent")]
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure: {message}")]
pub struct InvokeError {
    pub kind: InvokeErrorKind,
    pub message: String,
    /// Server supplied minimum wait before the next attempt
    pub retry_after: Option<Duration>,
}

impl InvokeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: InvokeErrorKind::Transient,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: InvokeErrorKind::Permanent,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == InvokeErrorKind::Transient
    }
}

impl From<MistralRequestError> for InvokeError {
    fn from(err: MistralRequestError) -> Self {
        let kind = if err.is_retryable() {
            InvokeErrorKind::Transient
        } else {
            InvokeErrorKind::Permanent
        };
        Self {
            kind,
            retry_after: err.retry_after(),
            message: err.to_string(),
        }
    }
}

/// Embeds texts through `v1/embeddings`.
#[derive(Debug, Clone)]
pub struct EmbeddingsInvoker {
    client: Mistral,
    output_dimension: Option<u32>,
}

impl EmbeddingsInvoker {
    pub fn new(client: Mistral) -> Self {
        Self {
            client,
            output_dimension: None,
        }
    }

    /// Truncated vector size, for models that support it.
    #[must_use]
    pub fn with_output_dimension(mut self, dimension: u32) -> Self {
        self.output_dimension = Some(dimension);
        self
    }
}

#[async_trait]
impl EndpointInvoker for EmbeddingsInvoker {
    type Item = String;
    type Output = Vec<f32>;

    async fn invoke(&self, model: &str, items: &[String]) -> Result<Vec<Vec<f32>>, InvokeError> {
        let request = EmbeddingsRequest::builder()
            .model(model)
            .input(TextInput::from(items))
            .maybe_output_dimension(self.output_dimension)
            .build();
        let response = self.client.embeddings(&request).await?;
        Ok(response.into_vectors())
    }
}

/// Moderates texts through `v1/moderations`.
#[derive(Debug, Clone)]
pub struct ModerationInvoker {
    client: Mistral,
}

impl ModerationInvoker {
    pub fn new(client: Mistral) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointInvoker for ModerationInvoker {
    type Item = String;
    type Output = ModerationResult;

    async fn invoke(
        &self,
        model: &str,
        items: &[String],
    ) -> Result<Vec<ModerationResult>, InvokeError> {
        let request = ModerationRequest::builder()
            .model(model)
            .input(TextInput::from(items))
            .build();
        Ok(self.client.moderate(&request).await?.results)
    }
}

/// Scores texts with a classifier model through `v1/classifications`.
#[derive(Debug, Clone)]
pub struct ClassificationInvoker {
    client: Mistral,
}

impl ClassificationInvoker {
    pub fn new(client: Mistral) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointInvoker for ClassificationInvoker {
    type Item = String;
    type Output = ClassificationResult;

    async fn invoke(
        &self,
        model: &str,
        items: &[String],
    ) -> Result<Vec<ClassificationResult>, InvokeError> {
        let request = ClassificationRequest::builder()
            .model(model)
            .input(TextInput::from(items))
            .build();
        Ok(self.client.classify(&request).await?.results)
    }
}
