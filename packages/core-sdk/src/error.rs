use std::time::Duration;

use thiserror::Error;

/// 错误信息中保留的响应体最大字符数。
pub const BODY_SNIPPET_CHARS: usize = 200;

/**
 * \brief 单个模型调用失败的原因。
 * \details Display 文本即面向用户的错误描述；`kind()` 保留细分类别用于日志诊断。
 *          任何变体都不包含密钥内容。
 */
#[derive(Debug, Error)]
pub enum DispatchError {
    /** \brief 凭据名在环境中不存在，未发起任何网络请求。 */
    #[error("API key {credential} not found in environment")]
    CredentialMissing { credential: String },

    /** \brief universal 类型模型未配置 URL，未发起任何网络请求。 */
    #[error("{provider}: no API URL configured for model {model}")]
    EndpointMissing { provider: String, model: String },

    /** \brief 连接失败、DNS 失败或超时。 */
    #[error("{}", describe_transport(.provider, .elapsed, .timed_out, .cause))]
    Transport {
        provider: String,
        elapsed: Duration,
        timed_out: bool,
        cause: String,
    },

    /** \brief Provider 返回非 2xx 状态码。 */
    #[error("{provider}: HTTP {status}: {snippet}")]
    Provider {
        provider: String,
        status: u16,
        snippet: String,
    },

    /** \brief 状态码正常但响应缺少 `choices[0].message.content`。 */
    #[error("{provider}: malformed response: {detail}")]
    MalformedResponse { provider: String, detail: String },
}

impl DispatchError {
    /**
     * \brief 返回细分类别标签，供 telemetry 使用。
     */
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CredentialMissing { .. } => "credential_missing",
            DispatchError::EndpointMissing { .. } => "endpoint_missing",
            DispatchError::Transport { timed_out: true, .. } => "timeout",
            DispatchError::Transport { .. } => "transport",
            DispatchError::Provider { .. } => "provider_status",
            DispatchError::MalformedResponse { .. } => "malformed_response",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Transport { timed_out: true, .. })
    }

    pub(crate) fn transport(provider: &str, elapsed: Duration, err: &reqwest::Error) -> Self {
        DispatchError::Transport {
            provider: provider.to_string(),
            elapsed,
            timed_out: err.is_timeout(),
            cause: err.to_string(),
        }
    }

    pub(crate) fn provider_status(provider: &str, status: u16, body: &str) -> Self {
        DispatchError::Provider {
            provider: provider.to_string(),
            status,
            snippet: snippet(body),
        }
    }

    pub(crate) fn malformed(provider: &str, detail: impl Into<String>) -> Self {
        DispatchError::MalformedResponse {
            provider: provider.to_string(),
            detail: detail.into(),
        }
    }
}

fn describe_transport(provider: &str, elapsed: &Duration, timed_out: &bool, cause: &str) -> String {
    if *timed_out {
        format!(
            "{}: request timed out after {:.2}s",
            provider,
            elapsed.as_secs_f64()
        )
    } else {
        format!(
            "{}: request failed after {:.2}s: {}",
            provider,
            elapsed.as_secs_f64(),
            cause
        )
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    let mut out: String = trimmed.chars().take(BODY_SNIPPET_CHARS).collect();
    if trimmed.chars().count() > BODY_SNIPPET_CHARS {
        out.push('…');
    }
    out
}

/**
 * \brief 提示词改写流程的错误。
 */
#[derive(Debug, Error)]
pub enum ImproveError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("prompt improvement failed: {0}")]
    Dispatch(#[from] DispatchError),
}
