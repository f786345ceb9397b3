use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};

use crate::{llm, telemetry};

/**
 * \brief 中继服务配置。
 */
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /** \brief 前端静态目录，需包含 index.html */
    pub ui_dir: PathBuf,
    /** \brief 上游 API 基地址 */
    pub upstream_base: String,
    /** \brief 单次上游调用超时 */
    pub upstream_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ui_dir: PathBuf::from("web"),
            upstream_base: llm::DEFAULT_UPSTREAM_BASE.to_string(),
            upstream_timeout: Duration::from_secs(120),
        }
    }
}

impl RelayConfig {
    /**
     * \brief 从环境变量读取：MEDLENS_UI_DIR、MEDLENS_UPSTREAM_BASE、MEDLENS_UPSTREAM_TIMEOUT_SECS。
     */
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ui_dir: std::env::var("MEDLENS_UI_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ui_dir),
            upstream_base: std::env::var("MEDLENS_UPSTREAM_BASE")
                .unwrap_or(defaults.upstream_base),
            upstream_timeout: std::env::var("MEDLENS_UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
        }
    }
}

#[derive(Clone)]
struct AppState {
    client: reqwest::Client,
    upstream_base: String,
}

/**
 * \brief 组装路由：中继、存活探针，其余路径回落到前端入口页。
 */
pub fn build_router(config: &RelayConfig) -> Result<Router> {
    let client = reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .build()?;
    let state = AppState {
        client,
        upstream_base: config.upstream_base.clone(),
    };

    let index = config.ui_dir.join("index.html");
    let static_handler = ServeDir::new(&config.ui_dir)
        .append_index_html_on_directories(true)
        .fallback(ServeFile::new(index));

    Ok(Router::new()
        .route("/api/messages", post(relay_messages))
        .route("/api/health", get(health_check))
        .fallback_service(static_handler)
        .layer(CorsLayer::permissive())
        .with_state(state))
}

/**
 * \brief 启动本地 HTTP 服务，提供中继接口与静态前端。
 * \param addr 监听地址，如 "127.0.0.1:3001"
 */
pub async fn run(addr: &str, config: RelayConfig) -> Result<()> {
    let app = build_router(&config)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    println!("Relaying to {}", config.upstream_base);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 中继请求体；除凭据外均原样转发。
 */
#[derive(Deserialize, Debug, Default)]
struct RelayPayload {
    #[serde(default, alias = "apiKey")]
    api_key: Option<String>,
    #[serde(default)]
    messages: Option<Value>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, alias = "maxTokens")]
    max_tokens: Option<u32>,
}

fn error_response(status: StatusCode, message: &str, kind: &str) -> Response {
    (
        status,
        Json(json!({"error": {"message": message, "type": kind}})),
    )
        .into_response()
}

/**
 * \brief 原样返回上游响应体，沿用上游的 Content-Type。
 */
fn passthrough(reply: llm::UpstreamReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = reply
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    (status, [(CONTENT_TYPE, content_type)], reply.body).into_response()
}

/**
 * \brief 中继接口：POST /api/messages。
 * \details 缺少凭据或消息列表时返回 400 且不访问上游；上游的状态码、Content-Type 与响应体原样返回；本地异常返回 500。
 */
async fn relay_messages(
    State(state): State<AppState>,
    payload: Result<Json<RelayPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &rejection.body_text(),
                "invalid_request_error",
            );
        }
    };

    let api_key = match payload.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "API key is required",
                "invalid_request_error",
            );
        }
    };

    let messages = match payload.messages {
        Some(messages @ Value::Array(_)) => messages,
        Some(Value::Null) | None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "messages is required",
                "invalid_request_error",
            );
        }
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "messages must be an array",
                "invalid_request_error",
            );
        }
    };

    let upstream = llm::UpstreamPayload {
        messages,
        system: payload.system,
        model: payload.model,
        max_tokens: payload.max_tokens,
    };
    let msg_count = upstream.messages.as_array().map_or(0, |a| a.len());

    match llm::forward_messages(&state.client, &state.upstream_base, &api_key, &upstream).await {
        Ok(reply) => {
            telemetry::log_event(
                "server.relay",
                &format!(
                    "model={} msgs={} status={}",
                    upstream.model(),
                    msg_count,
                    reply.status
                ),
            );
            passthrough(reply)
        }
        Err(e) => {
            telemetry::log_error("server.relay", &format!("forward failed: {}", e));
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &e.to_string(),
                "server_error",
            )
        }
    }
}

/**
 * \brief 存活探针：GET /api/health，无副作用。
 */
async fn health_check() -> Json<Value> {
    let now = OffsetDateTime::now_utc();
    let timestamp = now
        .format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    Json(json!({"status": "ok", "timestamp": timestamp}))
}
