use std::collections::HashMap;

use async_stream::try_stream;
use futures_util::stream::{self, BoxStream};
use reqwest::{Method, RequestBuilder as ReqwestRequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::{self, CommonRequestError},
    streaming::SseParser,
};

/// HTTP method for API endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

/// Authentication method for API requests
#[derive(Clone)]
pub enum AuthMethod {
    /// `Authorization: Bearer <token>`
    Bearer(String),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
        }
    }
}

/// A single API operation: path relative to the base URL plus method.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: String,
    pub method: HttpMethod,
    pub query_params: Option<Vec<(String, String)>>,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            path: path.into(),
            method,
            query_params: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Get)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Post)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Delete)
    }

    /// Append a query parameter; `None` values are skipped.
    pub fn with_query<V: ToString>(mut self, key: impl Into<String>, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.query_params
                .get_or_insert_with(Vec::new)
                .push((key.into(), value.to_string()));
        }
        self
    }
}

/// Configuration for request building
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub base_url: String,
    pub auth: Option<AuthMethod>,
    pub default_headers: HashMap<String, String>,
    pub user_agent: Option<String>,
}

impl RequestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: None,
            default_headers: HashMap::new(),
            user_agent: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Absolute URL for an endpoint path.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Executes endpoint calls against one provider: one HTTP round trip per
/// call, or a lazily read SSE stream.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    client: reqwest::Client,
    config: RequestConfig,
}

impl RequestBuilder {
    pub fn new(client: reqwest::Client, config: RequestConfig) -> Self {
        Self { client, config }
    }

    /// Build a reqwest RequestBuilder for the given endpoint
    pub fn build_request(&self, endpoint: &Endpoint) -> ReqwestRequestBuilder {
        self.build_request_with_options(endpoint, true)
    }

    /// Build a reqwest RequestBuilder, optionally without the JSON content type
    /// (multipart bodies set their own).
    pub fn build_request_with_options(
        &self,
        endpoint: &Endpoint,
        add_json_content_type: bool,
    ) -> ReqwestRequestBuilder {
        let url = self.config.url_for(&endpoint.path);
        let mut req = self.client.request(endpoint.method.into(), &url);

        if let Some(ref params) = endpoint.query_params {
            req = req.query(params);
        }

        if let Some(AuthMethod::Bearer(ref token)) = self.config.auth {
            req = req.bearer_auth(token);
        }

        for (key, value) in &self.config.default_headers {
            req = req.header(key, value);
        }

        if let Some(ref user_agent) = self.config.user_agent {
            req = req.header(reqwest::header::USER_AGENT, user_agent);
        }

        if add_json_content_type && endpoint.method == HttpMethod::Post {
            req = req.header(reqwest::header::CONTENT_TYPE, "application/json");
        }

        req
    }

    /// Execute a request with an optional JSON body and decode the JSON response
    pub async fn request_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        body: Option<&B>,
    ) -> Result<T, CommonRequestError> {
        let mut req = self.build_request(endpoint);

        if let Some(body) = body {
            // Normalize to a Value first so the payload is encoded exactly once.
            let payload = serde_json::to_value(body)?;
            tracing::trace!(path = %endpoint.path, %payload, "sending JSON body");
            req = req.json(&payload);
        }

        tracing::debug!(method = ?endpoint.method, path = %endpoint.path, "request");
        let res = req.send().await?;
        Self::handle_response(res).await
    }

    /// Execute a request without body and decode the JSON response
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
    ) -> Result<T, CommonRequestError> {
        self.request_json(endpoint, None::<&()>).await
    }

    /// Execute a request and return raw bytes (for file downloads)
    pub async fn request_bytes(
        &self,
        endpoint: &Endpoint,
    ) -> Result<bytes::Bytes, CommonRequestError> {
        tracing::debug!(method = ?endpoint.method, path = %endpoint.path, "request (raw)");
        let res = self.build_request(endpoint).send().await?;

        if res.status().is_success() {
            Ok(res.bytes().await?)
        } else {
            Err(Self::error_from_response(res).await)
        }
    }

    /// Execute a multipart form request (for file uploads)
    pub async fn request_multipart<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        form: reqwest::multipart::Form,
    ) -> Result<T, CommonRequestError> {
        tracing::debug!(path = %endpoint.path, "multipart upload");
        let res = self
            .build_request_with_options(endpoint, false)
            .multipart(form)
            .send()
            .await?;
        Self::handle_response(res).await
    }

    /// Execute a streaming request; the body gets `"stream": true`.
    pub fn stream<T, B>(
        &self,
        endpoint: &Endpoint,
        body: Option<&B>,
    ) -> BoxStream<'static, Result<T, CommonRequestError>>
    where
        T: DeserializeOwned + Send + 'static,
        B: Serialize + ?Sized,
    {
        let body_value = match body.map(serde_json::to_value).transpose() {
            Ok(value) => value,
            Err(e) => return Box::pin(stream::once(async move { Err(e.into()) })),
        };

        self.stream_with_options(endpoint, body_value, StreamOptions::default())
    }

    /// Execute a streaming request with fine-grained configuration.
    ///
    /// Nothing is sent until the returned stream is first polled. Dropping the
    /// stream releases the connection.
    pub fn stream_with_options<T>(
        &self,
        endpoint: &Endpoint,
        body: Option<Value>,
        options: StreamOptions,
    ) -> BoxStream<'static, Result<T, CommonRequestError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let req = match self.prepare_stream_request(endpoint, body, options) {
            Ok(req) => req,
            Err(e) => return Box::pin(stream::once(async move { Err(e) })),
        };
        let path = endpoint.path.clone();

        Box::pin(try_stream! {
            tracing::debug!(path = %path, "opening event stream");
            let response = req.send().await?;

            if response.status().is_success() {
                let mut parser = SseParser::new(response);
                while let Some(event) = parser.next_event::<T>().await? {
                    yield event;
                }
            } else {
                Err::<(), CommonRequestError>(Self::error_from_response(response).await)?;
            }
        })
    }

    fn prepare_stream_request(
        &self,
        endpoint: &Endpoint,
        body: Option<Value>,
        options: StreamOptions,
    ) -> Result<ReqwestRequestBuilder, CommonRequestError> {
        let mut req = self
            .build_request(endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        if let Some(body_value) = body {
            let Value::Object(mut obj) = body_value else {
                return Err(CommonRequestError::RequestBuilder(
                    "streaming body must be a JSON object".to_string(),
                ));
            };

            if options.set_stream_field {
                obj.insert("stream".to_string(), Value::Bool(true));
            }

            tracing::trace!(path = %endpoint.path, payload = ?obj, "sending streaming body");
            req = req.json(&obj);
        }

        Ok(req)
    }

    async fn handle_response<T: DeserializeOwned>(res: Response) -> Result<T, CommonRequestError> {
        let status = res.status();
        if !status.is_success() {
            return Err(Self::error_from_response(res).await);
        }

        let bytes = res.bytes().await?;
        serde_json::from_slice::<T>(&bytes).map_err(|e| {
            CommonRequestError::UnexpectedResponse(format!(
                "HTTP {} but failed to decode JSON: {}; body: {}",
                status.as_u16(),
                e,
                String::from_utf8_lossy(&bytes)
            ))
        })
    }

    async fn error_from_response(res: Response) -> CommonRequestError {
        let status = res.status();
        let retry_after = error::parse_retry_after(res.headers());
        match res.bytes().await {
            Ok(bytes) => {
                let err = error::parse_error_response(status, &bytes, retry_after);
                tracing::debug!(status = status.as_u16(), error = %err, "request failed");
                err
            }
            Err(e) => e.into(),
        }
    }
}

/// Options that control how streaming requests are constructed.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Whether to set `"stream": true` in the JSON body before sending the request.
    pub set_stream_field: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            set_stream_field: true,
        }
    }
}

/// Helper struct for building multipart forms
#[derive(Debug, Default)]
pub struct MultipartForm {
    form: reqwest::multipart::Form,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a text field
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form = self.form.text(name.into(), value.into());
        self
    }

    /// Add a file part; an unparseable MIME type is rejected.
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<Self, CommonRequestError> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.into())
            .mime_str(mime_type)
            .map_err(|e| {
                CommonRequestError::RequestBuilder(format!("invalid MIME type {mime_type}: {e}"))
            })?;
        self.form = self.form.part(name.into(), part);
        Ok(self)
    }

    pub fn build(self) -> reqwest::multipart::Form {
        self.form
    }
}
