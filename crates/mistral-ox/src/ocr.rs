use base64::{Engine, engine::general_purpose::STANDARD};
use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::usage::OcrUsage;

/// Document handed to the OCR endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    DocumentUrl {
        document_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_name: Option<String>,
    },
    ImageUrl {
        image_url: String,
    },
}

impl Document {
    pub fn url(url: impl Into<String>) -> Self {
        Self::DocumentUrl {
            document_url: url.into(),
            document_name: None,
        }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: url.into(),
        }
    }

    /// Inline a PDF as a base64 data URL.
    pub fn pdf_bytes(bytes: &[u8]) -> Self {
        Self::url(data_url("application/pdf", bytes))
    }

    /// Inline an image as a base64 data URL.
    pub fn image_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self::image_url(data_url(mime_type, bytes))
    }
}

fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct OcrRequest {
    #[builder(into)]
    pub model: String,
    pub document: Document,
    /// Zero-based page numbers; all pages when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_image_base64: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_min_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResponse {
    pub pages: Vec<OcrPage>,
    pub model: String,
    pub usage_info: OcrUsage,
}

impl OcrResponse {
    /// Markdown of all pages, separated by blank lines.
    pub fn markdown(&self) -> String {
        self.pages
            .iter()
            .map(|page| page.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    pub index: u32,
    pub markdown: String,
    #[serde(default)]
    pub images: Vec<OcrImage>,
    #[serde(default)]
    pub dimensions: Option<PageDimensions>,
}

/// Bounding box of an extracted image, in page pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrImage {
    pub id: String,
    pub top_left_x: Option<u32>,
    pub top_left_y: Option<u32>,
    pub bottom_right_x: Option<u32>,
    pub bottom_right_y: Option<u32>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageDimensions {
    pub dpi: u32,
    pub height: u32,
    pub width: u32,
}
