use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::models::{RelayReply, RelayRequest, Usage};
use crate::workflow::CallFailure;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_UPSTREAM_BASE: &str = "https://api.anthropic.com";

/**
 * \brief 上游原始响应：状态码、内容类型与未改动的响应体。
 */
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    /** \brief 上游的 Content-Type，缺失时为 `None` */
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/**
 * \brief 上游请求体，消息列表原样转发。
 */
#[derive(Debug, Clone)]
pub struct UpstreamPayload {
    pub messages: Value,
    pub system: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

impl UpstreamPayload {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn body(&self) -> Value {
        let mut body = json!({
            "model": self.model(),
            "max_tokens": self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": self.messages,
        });
        if let Some(sys) = &self.system {
            body["system"] = json!(sys);
        }
        body
    }
}

/**
 * \brief 调用 Anthropic Messages 接口；非 2xx 不视为错误，状态码和响应体原样返回。
 * \details 仅网络层失败（连接、超时、读取响应体）会返回 Err。
 */
pub async fn forward_messages(
    client: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    payload: &UpstreamPayload,
) -> Result<UpstreamReply> {
    let url = format!("{}/v1/messages", api_base.trim_end_matches('/'));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );

    let resp = client
        .post(url)
        .headers(headers)
        .json(&payload.body())
        .send()
        .await?;
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().await?.to_vec();
    Ok(UpstreamReply {
        status,
        content_type,
        body,
    })
}

/**
 * \brief 取 `content` 数组中的文本块并拼接。
 */
pub fn extract_reply_text(v: &Value) -> String {
    v.get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub fn extract_usage(v: &Value) -> Usage {
    v.get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default()
}

/**
 * \brief 错误响应中的 `error.message`，取不到时退回原始文本。
 */
pub fn extract_error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("error").and_then(|e| match e {
                Value::String(s) => Some(s.clone()),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string()),
            })
        })
        .unwrap_or_else(|| text.trim().to_string())
}

/**
 * \brief 控制器发起模型调用的抽象，便于替换为测试桩。
 */
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send(&self, request: &RelayRequest) -> Result<RelayReply, CallFailure>;
}

/**
 * \brief 通过 HTTP 调用本地中继服务。
 */
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRelay {
    pub fn new(relay_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/messages", relay_base.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RelayTransport for HttpRelay {
    async fn send(&self, request: &RelayRequest) -> Result<RelayReply, CallFailure> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| CallFailure::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CallFailure::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(CallFailure::Upstream {
                status: status.as_u16(),
                message: extract_error_message(&body),
            });
        }
        let v: Value = serde_json::from_slice(&body)
            .map_err(|e| CallFailure::Transport(format!("invalid relay response: {}", e)))?;
        Ok(RelayReply {
            text: extract_reply_text(&v),
            usage: extract_usage(&v),
        })
    }
}
