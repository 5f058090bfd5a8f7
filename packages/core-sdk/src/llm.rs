use std::{fmt, time::Instant};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DispatchError;
use crate::models::{Message, ModelConfig};

/**
 * \brief Provider 家族。所有家族共用 OpenAI Chat Completions 报文格式，
 *        区别仅在默认地址、默认模型名与元数据标签，见 `FAMILY_TABLE`。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    OpenRouter,
    OpenAI,
    DeepSeek,
    Groq,
    Universal,
}

/**
 * \brief 单个家族的适配参数。
 */
#[derive(Debug)]
pub struct FamilyProfile {
    pub family: ProviderFamily,
    /** \brief 元数据与数据库中使用的标签 */
    pub tag: &'static str,
    /** \brief 模型配置未给出 URL 时使用；None 表示必须显式配置 */
    pub default_endpoint: Option<&'static str>,
    /** \brief 显示名称为空或不合规时使用的模型标识 */
    pub default_model: &'static str,
    /** \brief 模型名是否必须为 "vendor/model" 形式 */
    pub requires_vendor_prefix: bool,
    /** \brief 额外请求头 */
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const FAMILY_TABLE: &[FamilyProfile] = &[
    FamilyProfile {
        family: ProviderFamily::OpenRouter,
        tag: "openrouter",
        default_endpoint: Some("https://openrouter.ai/api/v1/chat/completions"),
        default_model: "openai/gpt-3.5-turbo",
        requires_vendor_prefix: true,
        extra_headers: &[
            ("HTTP-Referer", "https://github.com/chatlist/chatlist"),
            ("X-Title", "ChatList"),
        ],
    },
    FamilyProfile {
        family: ProviderFamily::OpenAI,
        tag: "openai",
        default_endpoint: Some("https://api.openai.com/v1/chat/completions"),
        default_model: "gpt-3.5-turbo",
        requires_vendor_prefix: false,
        extra_headers: &[],
    },
    FamilyProfile {
        family: ProviderFamily::DeepSeek,
        tag: "deepseek",
        default_endpoint: Some("https://api.deepseek.com/v1/chat/completions"),
        default_model: "deepseek-chat",
        requires_vendor_prefix: false,
        extra_headers: &[],
    },
    FamilyProfile {
        family: ProviderFamily::Groq,
        tag: "groq",
        default_endpoint: Some("https://api.groq.com/openai/v1/chat/completions"),
        default_model: "mixtral-8x7b-32768",
        requires_vendor_prefix: false,
        extra_headers: &[],
    },
    FamilyProfile {
        family: ProviderFamily::Universal,
        tag: "universal",
        default_endpoint: None,
        default_model: "unknown",
        requires_vendor_prefix: false,
        extra_headers: &[],
    },
];

impl ProviderFamily {
    pub const ALL: [ProviderFamily; 5] = [
        ProviderFamily::OpenRouter,
        ProviderFamily::OpenAI,
        ProviderFamily::DeepSeek,
        ProviderFamily::Groq,
        ProviderFamily::Universal,
    ];

    pub fn profile(self) -> &'static FamilyProfile {
        FAMILY_TABLE
            .iter()
            .find(|p| p.family == self)
            .unwrap_or(&FAMILY_TABLE[FAMILY_TABLE.len() - 1])
    }

    pub fn tag(self) -> &'static str {
        self.profile().tag
    }

    /**
     * \brief 严格解析（忽略大小写），未知标签返回 None。
     */
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        FAMILY_TABLE.iter().find(|p| p.tag == tag).map(|p| p.family)
    }

    /**
     * \brief 宽松解析：未知标签按 universal 处理，用于读取历史数据。
     */
    pub fn from_tag_lossy(tag: &str) -> Self {
        Self::parse(tag).unwrap_or(ProviderFamily::Universal)
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/**
 * \brief 归一化后的回复元数据，键名与已保存结果中的 JSON 保持一致。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /** \brief Provider 回显的模型标识，缺失时为请求的模型名 */
    pub model: String,
    /** \brief usage.total_tokens，缺失时为 0 */
    pub tokens_used: u64,
    /** \brief 耗时（秒，保留两位小数） */
    pub response_time: f64,
    /** \brief Provider 家族标签 */
    pub api_type: String,
}

/**
 * \brief 单次调用的成功结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub metadata: ResponseMetadata,
}

/**
 * \brief 一次 HTTP 调用的完整描述。密钥不会出现在 Debug 输出中。
 */
#[derive(Clone)]
pub struct ChatRequest {
    pub url: String,
    pub model: String,
    pub family: ProviderFamily,
    pub body: Value,
    secret: String,
}

impl ChatRequest {
    /** \brief 错误信息中使用的 Provider 归属，如 "openrouter (openai/gpt-4)"。 */
    pub fn label(&self) -> String {
        format!("{} ({})", self.family.tag(), self.model)
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.secret)
    }
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("family", &self.family)
            .field("body", &self.body)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/**
 * \brief 确定发送给 Provider 的模型标识。
 */
pub fn resolve_model_name(family: ProviderFamily, display_name: &str) -> String {
    let profile = family.profile();
    let name = display_name.trim();
    if name.is_empty() || (profile.requires_vendor_prefix && !name.contains('/')) {
        profile.default_model.to_string()
    } else {
        name.to_string()
    }
}

/**
 * \brief 确定请求地址：优先使用模型配置，其次家族默认值。
 */
pub fn resolve_endpoint(family: ProviderFamily, api_url: &str) -> Option<String> {
    let url = api_url.trim();
    if !url.is_empty() {
        return Some(url.to_string());
    }
    family.profile().default_endpoint.map(str::to_string)
}

/**
 * \brief 构建请求：`{"model": ..., "messages": [{"role": "user", "content": ...}]}`。
 */
pub fn build_request(
    config: &ModelConfig,
    secret: &str,
    prompt: &str,
) -> Result<ChatRequest, DispatchError> {
    let family = config.family;
    let model = resolve_model_name(family, &config.name);
    let url = resolve_endpoint(family, &config.api_url).ok_or_else(|| {
        DispatchError::EndpointMissing {
            provider: family.tag().to_string(),
            model: model.clone(),
        }
    })?;
    let body = json!({
        "model": model,
        "messages": [Message::user(prompt)],
    });
    Ok(ChatRequest {
        url,
        model,
        family,
        body,
        secret: secret.to_string(),
    })
}

/**
 * \brief 解析 Provider 回复为 (正文, 元数据)。
 * \details 只要求 `choices[0].message.content` 存在；`model` 与 `usage.total_tokens` 可缺省。
 */
pub fn parse_chat_response(
    request: &ChatRequest,
    body: &str,
    elapsed_secs: f64,
) -> Result<ChatReply, DispatchError> {
    let label = request.label();
    let v: Value = serde_json::from_str(body)
        .map_err(|e| DispatchError::malformed(&label, format!("invalid JSON: {}", e)))?;
    let content = extract_openai_content(&v)
        .ok_or_else(|| DispatchError::malformed(&label, "missing choices[0].message.content"))?;
    let model = v
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(&request.model)
        .to_string();
    let tokens_used = v
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    Ok(ChatReply {
        response: content,
        metadata: ResponseMetadata {
            model,
            tokens_used,
            response_time: round_secs(elapsed_secs),
            api_type: request.family.tag().to_string(),
        },
    })
}

/**
 * \brief 发送一次非流式请求并归一化结果。超时由 `client` 的配置决定。
 */
pub async fn chat_once(
    client: &reqwest::Client,
    request: &ChatRequest,
) -> Result<ChatReply, DispatchError> {
    let label = request.label();
    let started = Instant::now();

    let mut builder = client
        .post(&request.url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, request.bearer());
    for (name, value) in request.family.profile().extra_headers {
        builder = builder.header(*name, *value);
    }

    let resp = builder
        .json(&request.body)
        .send()
        .await
        .map_err(|e| DispatchError::transport(&label, started.elapsed(), &e))?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| DispatchError::transport(&label, started.elapsed(), &e))?;

    if !status.is_success() {
        return Err(DispatchError::provider_status(
            &label,
            status.as_u16(),
            &text,
        ));
    }
    parse_chat_response(request, &text, started.elapsed().as_secs_f64())
}

fn extract_openai_content(v: &Value) -> Option<String> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

fn round_secs(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, family: ProviderFamily, api_url: &str) -> ModelConfig {
        ModelConfig {
            id: 1,
            name: name.to_string(),
            api_url: api_url.to_string(),
            api_id: "KEY1".to_string(),
            family,
            is_active: true,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_family_parse_and_lossy_fallback() {
        assert_eq!(ProviderFamily::parse("GROQ"), Some(ProviderFamily::Groq));
        assert_eq!(ProviderFamily::parse("anthropic"), None);
        assert_eq!(
            ProviderFamily::from_tag_lossy("custom"),
            ProviderFamily::Universal
        );
        for family in ProviderFamily::ALL {
            assert_eq!(ProviderFamily::parse(family.tag()), Some(family));
        }
    }

    #[test]
    fn test_openrouter_requires_vendor_prefix() {
        assert_eq!(
            resolve_model_name(ProviderFamily::OpenRouter, "gpt-4"),
            "openai/gpt-3.5-turbo"
        );
        assert_eq!(
            resolve_model_name(ProviderFamily::OpenRouter, "anthropic/claude-3-opus"),
            "anthropic/claude-3-opus"
        );
        assert_eq!(resolve_model_name(ProviderFamily::OpenAI, "gpt-4"), "gpt-4");
        assert_eq!(resolve_model_name(ProviderFamily::DeepSeek, "  "), "deepseek-chat");
    }

    #[test]
    fn test_build_request_uses_default_endpoint_when_url_empty() {
        let req = build_request(&config("gpt-4o", ProviderFamily::OpenAI, ""), "sk", "Hello")
            .expect("request");
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(req.body["model"], "gpt-4o");
        assert_eq!(req.body["messages"][0]["role"], "user");
        assert_eq!(req.body["messages"][0]["content"], "Hello");
        assert_eq!(req.bearer(), "Bearer sk");
    }

    #[test]
    fn test_universal_without_url_is_endpoint_missing() {
        let err = build_request(&config("local", ProviderFamily::Universal, ""), "sk", "Hi")
            .unwrap_err();
        assert_eq!(err.kind(), "endpoint_missing");
    }

    #[test]
    fn test_request_debug_redacts_secret() {
        let req = build_request(
            &config("m", ProviderFamily::Groq, "http://localhost:1/v1"),
            "sk-very-secret",
            "Hi",
        )
        .expect("request");
        assert!(!format!("{:?}", req).contains("sk-very-secret"));
    }

    #[test]
    fn test_parse_response_with_usage() {
        let req = build_request(&config("a/model", ProviderFamily::OpenRouter, ""), "sk", "Hi")
            .expect("request");
        let body = r#"{"model":"a/model-2024","choices":[{"message":{"content":"X"}}],"usage":{"total_tokens":42}}"#;
        let reply = parse_chat_response(&req, body, 1.234).expect("parse");
        assert_eq!(reply.response, "X");
        assert_eq!(reply.metadata.tokens_used, 42);
        assert_eq!(reply.metadata.model, "a/model-2024");
        assert_eq!(reply.metadata.response_time, 1.23);
        assert_eq!(reply.metadata.api_type, "openrouter");
    }

    #[test]
    fn test_parse_response_defaults_optional_fields() {
        let req = build_request(&config("a/model", ProviderFamily::OpenRouter, ""), "sk", "Hi")
            .expect("request");
        let body = r#"{"choices":[{"message":{"content":"Hi there"}}]}"#;
        let reply = parse_chat_response(&req, body, 0.0).expect("parse");
        assert_eq!(reply.response, "Hi there");
        assert_eq!(reply.metadata.tokens_used, 0);
        assert_eq!(reply.metadata.model, "a/model");
    }

    #[test]
    fn test_parse_response_missing_content_is_malformed() {
        let req = build_request(&config("m", ProviderFamily::OpenAI, ""), "sk", "Hi")
            .expect("request");
        let err = parse_chat_response(&req, r#"{"choices":[]}"#, 0.0).unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        assert!(err.to_string().contains("openai (m)"));

        let err = parse_chat_response(&req, "<html>", 0.0).unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }
}
