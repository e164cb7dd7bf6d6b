use ai_ox_common::{
    AuthMethod, BoxStream, Endpoint, MultipartForm, RequestBuilder, RequestConfig,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::MistralRequestError;

/// Binds the shared request builder to Mistral's base URL and bearer auth.
#[derive(Debug, Clone)]
pub(crate) struct MistralRequestHelper {
    request_builder: RequestBuilder,
}

impl MistralRequestHelper {
    pub(crate) fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        let config = RequestConfig::new(base_url)
            .with_auth(AuthMethod::Bearer(api_key.to_string()))
            .with_header("accept", "application/json")
            .with_user_agent(concat!("mistral-ox/", env!("CARGO_PKG_VERSION")));

        Self {
            request_builder: RequestBuilder::new(client, config),
        }
    }

    pub(crate) async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, MistralRequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request_builder
            .request_json(&Endpoint::post(path), Some(body))
            .await
    }

    /// POST without a body, used by job state transitions.
    pub(crate) async fn post_empty<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, MistralRequestError> {
        self.request_builder.request(&Endpoint::post(path)).await
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
    ) -> Result<T, MistralRequestError> {
        self.request_builder.request(&endpoint).await
    }

    pub(crate) async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, MistralRequestError> {
        self.request_builder.request(&Endpoint::delete(path)).await
    }

    pub(crate) async fn bytes(&self, path: &str) -> Result<bytes::Bytes, MistralRequestError> {
        self.request_builder.request_bytes(&Endpoint::get(path)).await
    }

    pub(crate) async fn multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        form: MultipartForm,
    ) -> Result<T, MistralRequestError> {
        self.request_builder
            .request_multipart(&Endpoint::post(path), form.build())
            .await
    }

    pub(crate) fn stream<T, B>(
        &self,
        path: &str,
        body: &B,
    ) -> BoxStream<'static, Result<T, MistralRequestError>>
    where
        T: DeserializeOwned + Send + 'static,
        B: Serialize + ?Sized,
    {
        self.request_builder.stream(&Endpoint::post(path), Some(body))
    }
}
