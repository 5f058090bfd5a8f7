use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::ProviderFamily;

/**
 * \brief 模型配置。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 显示名称，同时作为 Provider 侧模型标识，如 "vendor/model-name"，全库唯一 */
    pub name: String,
    /** \brief 目标接口地址，为空时使用 Provider 家族的默认地址 */
    pub api_url: String,
    /** \brief 凭据引用：环境中保存 API Key 的变量名，而非密钥本身 */
    pub api_id: String,
    /** \brief Provider 家族 */
    pub family: ProviderFamily,
    /** \brief 是否参与默认分发 */
    pub is_active: bool,
    /** \brief 创建时间 */
    pub created_at: String,
}

/**
 * \brief 已保存的提示词。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: i64,
    /** \brief 创建时间 */
    pub date: String,
    /** \brief 提示词正文 */
    pub prompt: String,
    /** \brief 可选标签 */
    pub tags: Option<String>,
}

/**
 * \brief 已保存的模型回复，附带联表得到的提示词与模型名。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    pub prompt_id: i64,
    pub model_id: i64,
    pub response: String,
    pub saved_at: String,
    /** \brief 元数据；存储内容无法解析为 JSON 时为 None */
    pub metadata: Option<serde_json::Value>,
    pub prompt: Option<String>,
    pub model_name: Option<String>,
}

/**
 * \brief 新增模型时的输入。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewModel {
    pub name: String,
    pub api_url: String,
    pub api_id: String,
    pub model_type: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/**
 * \brief 模型的部分字段更新，None 表示保持不变。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_id: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl ModelPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.api_url.is_none()
            && self.api_id.is_none()
            && self.model_type.is_none()
            && self.is_active.is_none()
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 输入校验失败，服务端据此返回 400。
 */
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/**
 * \brief 校验模型配置，返回解析后的 Provider 家族。
 */
pub fn validate_model_input(
    name: &str,
    api_url: &str,
    api_id: &str,
    model_type: &str,
) -> Result<ProviderFamily, ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError("model name must not be empty".into()));
    }
    let url = api_url.trim();
    if url.is_empty() {
        return Err(ValidationError("API URL must not be empty".into()));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ValidationError(
            "API URL must start with http:// or https://".into(),
        ));
    }
    if api_id.trim().is_empty() {
        return Err(ValidationError(
            "API key variable name must not be empty".into(),
        ));
    }
    ProviderFamily::parse(model_type).ok_or_else(|| {
        let tags: Vec<&str> = ProviderFamily::ALL.iter().map(|f| f.tag()).collect();
        ValidationError(format!("model type must be one of: {}", tags.join(", ")))
    })
}
