#![cfg_attr(not(test), deny(unsafe_code))]
#![warn(
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::missing_docs_in_private_items
)]

//! Typed client for the Mistral AI API.
//!
//! [`Mistral`] covers chat (blocking and streaming), fill-in-the-middle,
//! agents, embeddings, OCR, moderation, classification, models, files,
//! fine-tuning and server-side batch jobs. The [`batch`] module adds an
//! in-process coordinator that fans large work lists out over the
//! embeddings, moderation and classification endpoints.

pub mod batch;
pub mod error;
mod internal;
pub mod message;
pub mod model;
pub mod ocr;
pub mod request;
pub mod response;
pub mod tool;
pub mod usage;

pub use error::MistralRequestError;
pub use message::{AssistantMessage, Content, ContentPart, Message, Messages};
pub use model::Model;
pub use ocr::{Document, OcrRequest, OcrResponse};
pub use request::{
    AgentsRequest, BatchJobRequest, ChatClassificationRequest, ChatModerationRequest,
    ChatRequest, ClassificationRequest, EmbeddingInput, EmbeddingsRequest, FimRequest,
    FineTuningHyperparameters, FineTuningRequest, ModerationRequest, ResponseFormat, TextInput,
    TrainingFile,
};
pub use response::{
    BatchJob, BatchJobsResponse, ChatCompletionChunk, ChatResponse, ClassificationResponse,
    EmbeddingsResponse, FileDeleteResponse, FileInfo, FilePurpose, FilesResponse, FineTuningJob,
    FineTuningJobsResponse, ModelInfo, ModelsResponse, ModerationResponse, ModerationResult,
};
pub use tool::{Tool, ToolCall, ToolChoice};
pub use usage::Usage;

use ai_ox_common::MultipartForm;
use bon::Builder;
use core::fmt;
use futures_util::stream::BoxStream;
#[cfg(feature = "leaky-bucket")]
use leaky_bucket::RateLimiter;
#[cfg(feature = "leaky-bucket")]
use std::sync::Arc;

use crate::{
    batch::{ClassificationInvoker, EmbeddingsInvoker, ModerationInvoker},
    internal::MistralRequestHelper,
};

const BASE_URL: &str = "https://api.mistral.ai";

#[derive(Clone, Default, Builder)]
pub struct Mistral {
    #[builder(into)]
    pub(crate) api_key: String,
    #[builder(default)]
    pub(crate) client: reqwest::Client,
    #[cfg(feature = "leaky-bucket")]
    pub(crate) leaky_bucket: Option<Arc<RateLimiter>>,
    #[builder(default = BASE_URL.to_string(), into)]
    pub(crate) base_url: String,
}

impl Mistral {
    /// Create a new Mistral client with the provided API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            #[cfg(feature = "leaky-bucket")]
            leaky_bucket: None,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Reads `MISTRAL_API_KEY`, and `MISTRAL_BASE_URL` when set.
    pub fn load_from_env() -> Result<Self, std::env::VarError> {
        let api_key = std::env::var("MISTRAL_API_KEY")?;
        let base_url = std::env::var("MISTRAL_BASE_URL").unwrap_or_else(|_| BASE_URL.to_string());
        Ok(Self::builder().api_key(api_key).base_url(base_url).build())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_helper(&self) -> MistralRequestHelper {
        MistralRequestHelper::new(self.client.clone(), &self.base_url, &self.api_key)
    }

    async fn throttle(&self) {
        #[cfg(feature = "leaky-bucket")]
        if let Some(ref limiter) = self.leaky_bucket {
            limiter.acquire_one().await;
        }
    }

    /// Rate-limited stream: the permit is taken when the stream is first polled.
    fn throttled_stream<T: Send + 'static>(
        &self,
        inner: BoxStream<'static, Result<T, MistralRequestError>>,
    ) -> BoxStream<'static, Result<T, MistralRequestError>> {
        #[cfg(feature = "leaky-bucket")]
        if let Some(limiter) = self.leaky_bucket.clone() {
            use futures_util::StreamExt;

            let mut inner = inner;
            return Box::pin(async_stream::stream! {
                limiter.acquire_one().await;
                while let Some(item) = inner.next().await {
                    yield item;
                }
            });
        }
        inner
    }
}

// Completions
impl Mistral {
    pub async fn send(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/chat/completions", request)
            .await
    }

    /// Stream a chat completion. Dropping the stream closes the connection.
    pub fn stream(
        &self,
        request: &ChatRequest,
    ) -> BoxStream<'static, Result<ChatCompletionChunk, MistralRequestError>> {
        self.throttled_stream(self.request_helper().stream("v1/chat/completions", request))
    }

    /// Fill-in-the-middle code completion
    pub async fn fim(&self, request: &FimRequest) -> Result<ChatResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/fim/completions", request)
            .await
    }

    pub fn stream_fim(
        &self,
        request: &FimRequest,
    ) -> BoxStream<'static, Result<ChatCompletionChunk, MistralRequestError>> {
        self.throttled_stream(self.request_helper().stream("v1/fim/completions", request))
    }

    pub async fn agents(
        &self,
        request: &AgentsRequest,
    ) -> Result<ChatResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/agents/completions", request)
            .await
    }

    pub fn stream_agents(
        &self,
        request: &AgentsRequest,
    ) -> BoxStream<'static, Result<ChatCompletionChunk, MistralRequestError>> {
        self.throttled_stream(
            self.request_helper()
                .stream("v1/agents/completions", request),
        )
    }
}

// Embeddings, OCR, moderation, classification
impl Mistral {
    pub async fn embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper().post("v1/embeddings", request).await
    }

    pub async fn ocr(&self, request: &OcrRequest) -> Result<OcrResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper().post("v1/ocr", request).await
    }

    pub async fn moderate(
        &self,
        request: &ModerationRequest,
    ) -> Result<ModerationResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper().post("v1/moderations", request).await
    }

    pub async fn moderate_chat(
        &self,
        request: &ChatModerationRequest,
    ) -> Result<ModerationResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/chat/moderations", request)
            .await
    }

    pub async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/classifications", request)
            .await
    }

    pub async fn classify_chat(
        &self,
        request: &ChatClassificationRequest,
    ) -> Result<ClassificationResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/chat/classifications", request)
            .await
    }

    /// Invoker for [`batch::BatchCoordinator`] over `v1/embeddings`.
    pub fn embeddings_invoker(&self) -> EmbeddingsInvoker {
        EmbeddingsInvoker::new(self.clone())
    }

    pub fn moderation_invoker(&self) -> ModerationInvoker {
        ModerationInvoker::new(self.clone())
    }

    pub fn classification_invoker(&self) -> ClassificationInvoker {
        ClassificationInvoker::new(self.clone())
    }
}

// Models and files
impl Mistral {
    pub async fn list_models(&self) -> Result<ModelsResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get("v1/models"))
            .await
    }

    pub async fn retrieve_model(&self, model_id: &str) -> Result<ModelInfo, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get(format!("v1/models/{model_id}")))
            .await
    }

    /// Upload a file; the MIME type is guessed from `filename`.
    pub async fn upload_file(
        &self,
        filename: &str,
        data: Vec<u8>,
        purpose: FilePurpose,
    ) -> Result<FileInfo, MistralRequestError> {
        let mime = mime_guess::from_path(filename).first_or_octet_stream();
        let form = MultipartForm::new()
            .text("purpose", purpose.to_string())
            .file("file", filename, data, mime.essence_str())?;

        self.throttle().await;
        self.request_helper().multipart("v1/files", form).await
    }

    pub async fn list_files(
        &self,
        purpose: Option<FilePurpose>,
    ) -> Result<FilesResponse, MistralRequestError> {
        self.throttle().await;
        let endpoint = ai_ox_common::Endpoint::get("v1/files").with_query("purpose", purpose);
        self.request_helper().get(endpoint).await
    }

    pub async fn retrieve_file(&self, file_id: &str) -> Result<FileInfo, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get(format!("v1/files/{file_id}")))
            .await
    }

    pub async fn delete_file(
        &self,
        file_id: &str,
    ) -> Result<FileDeleteResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .delete(&format!("v1/files/{file_id}"))
            .await
    }

    /// Raw file contents, e.g. the output of a finished batch job.
    pub async fn download_file(&self, file_id: &str) -> Result<bytes::Bytes, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .bytes(&format!("v1/files/{file_id}/content"))
            .await
    }
}

// Fine-tuning and server-side batch jobs
impl Mistral {
    pub async fn list_fine_tuning_jobs(
        &self,
    ) -> Result<FineTuningJobsResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get("v1/fine_tuning/jobs"))
            .await
    }

    pub async fn create_fine_tuning_job(
        &self,
        request: &FineTuningRequest,
    ) -> Result<FineTuningJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post("v1/fine_tuning/jobs", request)
            .await
    }

    pub async fn retrieve_fine_tuning_job(
        &self,
        job_id: &str,
    ) -> Result<FineTuningJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get(format!(
                "v1/fine_tuning/jobs/{job_id}"
            )))
            .await
    }

    /// Start a job created with `auto_start: false`.
    pub async fn start_fine_tuning_job(
        &self,
        job_id: &str,
    ) -> Result<FineTuningJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post_empty(&format!("v1/fine_tuning/jobs/{job_id}/start"))
            .await
    }

    pub async fn cancel_fine_tuning_job(
        &self,
        job_id: &str,
    ) -> Result<FineTuningJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post_empty(&format!("v1/fine_tuning/jobs/{job_id}/cancel"))
            .await
    }

    pub async fn list_batch_jobs(&self) -> Result<BatchJobsResponse, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get("v1/batch/jobs"))
            .await
    }

    pub async fn create_batch_job(
        &self,
        request: &BatchJobRequest,
    ) -> Result<BatchJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper().post("v1/batch/jobs", request).await
    }

    pub async fn retrieve_batch_job(&self, job_id: &str) -> Result<BatchJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .get(ai_ox_common::Endpoint::get(format!("v1/batch/jobs/{job_id}")))
            .await
    }

    pub async fn cancel_batch_job(&self, job_id: &str) -> Result<BatchJob, MistralRequestError> {
        self.throttle().await;
        self.request_helper()
            .post_empty(&format!("v1/batch/jobs/{job_id}/cancel"))
            .await
    }
}

impl fmt::Debug for Mistral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mistral")
            .field("api_key", &"[REDACTED]")
            .field("client", &self.client)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
