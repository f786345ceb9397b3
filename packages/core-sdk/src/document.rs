use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;

use crate::models::{Base64Source, ContentBlock};

const IMAGE_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];
const TEXT_TYPES: [&str; 4] = ["text/plain", "text/markdown", "text/x-markdown", "text/csv"];

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("unsupported file type: {0} (use PDF, PNG, JPEG, GIF, WEBP or plain text)")]
    Unsupported(String),
    #[error("document is empty")]
    Empty,
    #[error("read document failed: {0}")]
    Io(#[from] std::io::Error),
}

/**
 * \brief 待解析的医疗文档：粘贴文本、PDF 或图片。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Text(String),
    Pdf(Vec<u8>),
    Image { media_type: String, bytes: Vec<u8> },
}

impl Document {
    /**
     * \brief 按扩展名判断类型并读取文件；不支持的类型在发起任何请求前即被拒绝。
     */
    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Self::from_bytes(&mime, std::fs::read(path)?)
    }

    pub fn from_bytes(media_type: &str, bytes: Vec<u8>) -> Result<Self, DocumentError> {
        if bytes.is_empty() {
            return Err(DocumentError::Empty);
        }
        if media_type == "application/pdf" {
            return Ok(Document::Pdf(bytes));
        }
        if IMAGE_TYPES.contains(&media_type) {
            return Ok(Document::Image {
                media_type: media_type.to_string(),
                bytes,
            });
        }
        if TEXT_TYPES.contains(&media_type) {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if text.trim().is_empty() {
                return Err(DocumentError::Empty);
            }
            return Ok(Document::Text(text));
        }
        Err(DocumentError::Unsupported(media_type.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Document::Text(t) => t.trim().is_empty(),
            Document::Pdf(b) => b.is_empty(),
            Document::Image { bytes, .. } => bytes.is_empty(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Document::Text(t) => format!("text ({} chars)", t.chars().count()),
            Document::Pdf(b) => format!("application/pdf ({} bytes)", b.len()),
            Document::Image { media_type, bytes } => {
                format!("{} ({} bytes)", media_type, bytes.len())
            }
        }
    }

    pub(crate) fn to_block(&self) -> ContentBlock {
        match self {
            Document::Text(t) => ContentBlock::Text { text: t.clone() },
            Document::Pdf(b) => ContentBlock::Document {
                source: Base64Source::new("application/pdf", BASE64.encode(b)),
            },
            Document::Image { media_type, bytes } => ContentBlock::Image {
                source: Base64Source::new(media_type, BASE64.encode(bytes)),
            },
        }
    }
}
