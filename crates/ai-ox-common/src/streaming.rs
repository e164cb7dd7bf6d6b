use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::CommonRequestError;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Server-Sent Events reader for streaming responses.
///
/// Reads lazily from the underlying body; each call to [`SseParser::next_event`]
/// pulls only as many bytes as needed to complete one `data:` event. Dropping
/// the parser drops the response body and with it the connection.
pub struct SseParser {
    byte_stream: ByteStream,
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    done: bool,
}

impl SseParser {
    pub fn new(response: reqwest::Response) -> Self {
        Self::from_stream(response.bytes_stream())
    }

    /// Build a parser over any chunked byte source.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        Self {
            byte_stream: Box::pin(stream),
            buffer: Vec::new(),
            data_lines: Vec::new(),
            done: false,
        }
    }

    /// Get the next parsed event, `None` once the stream ended or `[DONE]` was seen.
    pub async fn next_event<T: DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, CommonRequestError> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(event) = self.drain_buffered_lines::<T>()? {
                return Ok(Some(event));
            }

            match self.byte_stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    self.done = true;
                    // A final line may arrive without a trailing newline.
                    if !self.buffer.is_empty() {
                        let line = String::from_utf8(std::mem::take(&mut self.buffer))?;
                        if let Some(event) = self.process_line::<T>(&line)? {
                            return Ok(Some(event));
                        }
                    }
                    return self.finalize_event();
                }
            }
        }
    }

    fn drain_buffered_lines<T: DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, CommonRequestError> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            let line = String::from_utf8(line_bytes)?;

            if let Some(event) = self.process_line::<T>(&line)? {
                return Ok(Some(event));
            }
            if self.done {
                break;
            }
        }

        Ok(None)
    }

    fn process_line<T: DeserializeOwned>(
        &mut self,
        line: &str,
    ) -> Result<Option<T>, CommonRequestError> {
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() {
            return self.finalize_event();
        }

        // Comment / keep-alive
        if line.starts_with(':') {
            return Ok(None);
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let data = rest.trim_start();
            if data == "[DONE]" {
                tracing::trace!("received [DONE] sentinel");
                self.data_lines.clear();
                self.done = true;
                return Ok(None);
            }
            if !data.is_empty() {
                self.data_lines.push(data.to_string());
            }
        }

        // event:, id:, retry: carry nothing we need
        Ok(None)
    }

    fn finalize_event<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CommonRequestError> {
        if self.data_lines.is_empty() {
            return Ok(None);
        }

        let payload = self.data_lines.join("\n");
        self.data_lines.clear();

        parse_payload(&payload).map(Some)
    }
}

fn parse_payload<T: DeserializeOwned>(payload: &str) -> Result<T, CommonRequestError> {
    serde_json::from_str(payload).map_err(|e| {
        tracing::debug!(error = %e, payload, "failed to decode SSE payload");
        CommonRequestError::InvalidEventData(format!("JSON parse error: {e}"))
    })
}
