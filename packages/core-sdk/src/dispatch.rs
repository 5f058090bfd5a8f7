use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_stream::stream;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::credentials::CredentialStore;
use crate::error::DispatchError;
use crate::llm::{self, ChatReply, ResponseMetadata};
use crate::models::ModelConfig;
use crate::telemetry;

/** \brief 单次调用的默认超时。 */
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/**
 * \brief 一个模型在一轮分发中的最终结果。
 */
#[derive(Debug)]
pub struct DispatchOutcome {
    pub model_id: i64,
    pub model_name: String,
    pub result: Result<ChatReply, DispatchError>,
}

/**
 * \brief 可序列化的结果视图，供导出与 HTTP 接口使用。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutcomeView {
    Ok {
        model_id: i64,
        model_name: String,
        response: String,
        metadata: ResponseMetadata,
    },
    Error {
        model_id: i64,
        model_name: String,
        message: String,
        error_kind: String,
    },
}

impl DispatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn reply(&self) -> Option<&ChatReply> {
        self.result.as_ref().ok()
    }

    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(|e| e.to_string())
    }

    /**
     * \brief 表格展示用文本：成功为回复正文，失败为带前缀的错误信息。
     */
    pub fn display_text(&self) -> String {
        match &self.result {
            Ok(reply) => reply.response.clone(),
            Err(err) => format!("ERROR: {}", err),
        }
    }

    pub fn view(&self) -> OutcomeView {
        match &self.result {
            Ok(reply) => OutcomeView::Ok {
                model_id: self.model_id,
                model_name: self.model_name.clone(),
                response: reply.response.clone(),
                metadata: reply.metadata.clone(),
            },
            Err(err) => OutcomeView::Error {
                model_id: self.model_id,
                model_name: self.model_name.clone(),
                message: err.to_string(),
                error_kind: err.kind().to_string(),
            },
        }
    }

    fn aborted(config: &ModelConfig) -> Self {
        Self {
            model_id: config.id,
            model_name: config.name.clone(),
            result: Err(DispatchError::Transport {
                provider: config.family.tag().to_string(),
                elapsed: Duration::ZERO,
                timed_out: false,
                cause: "dispatch unit aborted".to_string(),
            }),
        }
    }
}

/**
 * \brief 分发引擎：把同一提示词并发发送给多个模型。
 * \details 每个模型一个独立任务，互不等待；没有重试与限流。
 *          `reqwest::Client` 与 `CredentialStore` 在任务间只读共享。
 */
#[derive(Clone, Debug)]
pub struct Dispatcher {
    client: reqwest::Client,
    credentials: Arc<CredentialStore>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(credentials: Arc<CredentialStore>) -> Result<Self> {
        Self::with_timeout(credentials, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(credentials: Arc<CredentialStore>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /**
     * \brief 单模型调用原语：解析凭据 → 构建请求 → 发送。
     * \details 凭据缺失时直接返回错误，不发起网络请求。
     */
    pub async fn send_one(
        &self,
        config: &ModelConfig,
        prompt: &str,
    ) -> Result<ChatReply, DispatchError> {
        let secret = self.credentials.resolve(&config.api_id).ok_or_else(|| {
            DispatchError::CredentialMissing {
                credential: config.api_id.clone(),
            }
        })?;
        let request = llm::build_request(config, secret, prompt)?;
        llm::chat_once(&self.client, &request).await
    }

    /**
     * \brief 单模型调用并包装为 DispatchOutcome，同时记录日志。
     */
    pub async fn dispatch_one(&self, config: &ModelConfig, prompt: &str) -> DispatchOutcome {
        let result = self.send_one(config, prompt).await;
        match &result {
            Ok(reply) => telemetry::log_event(
                "dispatch",
                &format!(
                    "ok model={} type={} tokens={} elapsed={}s",
                    config.name,
                    config.family,
                    reply.metadata.tokens_used,
                    reply.metadata.response_time
                ),
            ),
            Err(err) => telemetry::log_warn(
                "dispatch",
                &format!(
                    "error model={} type={} kind={} detail={}",
                    config.name,
                    config.family,
                    err.kind(),
                    err
                ),
            ),
        }
        DispatchOutcome {
            model_id: config.id,
            model_name: config.name.clone(),
            result,
        }
    }

    /**
     * \brief 按完成顺序产出 `(输入下标, 结果)`。
     * \details 每个输入恰好产出一次；任务异常终止时补一个错误结果。
     *          丢弃该 Stream 会中止仍在进行的请求并释放连接。
     */
    pub fn dispatch_stream(
        &self,
        prompt: &str,
        configs: &[ModelConfig],
    ) -> impl Stream<Item = (usize, DispatchOutcome)> + Send + 'static {
        let this = self.clone();
        let prompt: Arc<str> = Arc::from(prompt);
        let configs = configs.to_vec();

        stream! {
            telemetry::log_event(
                "dispatch",
                &format!("round start models={} prompt_len={}", configs.len(), prompt.len()),
            );

            let mut units = JoinSet::new();
            for (index, config) in configs.iter().cloned().enumerate() {
                let unit = this.clone();
                let prompt = Arc::clone(&prompt);
                units.spawn(async move {
                    let outcome = unit.dispatch_one(&config, &prompt).await;
                    (index, outcome)
                });
            }

            let mut reported = vec![false; configs.len()];
            while let Some(joined) = units.join_next().await {
                match joined {
                    Ok((index, outcome)) => {
                        reported[index] = true;
                        yield (index, outcome);
                    }
                    Err(err) => {
                        telemetry::log_error("dispatch", &format!("unit aborted: {}", err));
                    }
                }
            }

            for (index, config) in configs.iter().enumerate() {
                if !reported[index] {
                    yield (index, DispatchOutcome::aborted(config));
                }
            }
        }
    }

    /**
     * \brief 一轮分发：返回与输入一一对应、顺序一致的结果。
     */
    pub async fn dispatch(&self, prompt: &str, configs: &[ModelConfig]) -> Vec<DispatchOutcome> {
        let mut slots: Vec<Option<DispatchOutcome>> = configs.iter().map(|_| None).collect();
        let outcomes = self.dispatch_stream(prompt, configs);
        pin_mut!(outcomes);
        while let Some((index, outcome)) = outcomes.next().await {
            slots[index] = Some(outcome);
        }
        slots
            .into_iter()
            .zip(configs)
            .map(|(slot, config)| slot.unwrap_or_else(|| DispatchOutcome::aborted(config)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderFamily;

    fn config(id: i64, cred: &str) -> ModelConfig {
        ModelConfig {
            id,
            name: format!("vendor/model-{}", id),
            api_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            api_id: cred.to_string(),
            family: ProviderFamily::OpenRouter,
            is_active: true,
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_yield_one_error_per_model() {
        let dispatcher = Dispatcher::new(Arc::new(CredentialStore::default())).expect("client");
        let configs = vec![config(1, "KEY_A"), config(2, "KEY_B"), config(3, "KEY_A")];
        let outcomes = dispatcher.dispatch("Hello", &configs).await;
        assert_eq!(outcomes.len(), 3);
        for (outcome, cfg) in outcomes.iter().zip(&configs) {
            assert_eq!(outcome.model_id, cfg.id);
            let message = outcome.error_message().expect("error outcome");
            assert!(message.contains(&cfg.api_id));
        }
    }

    #[tokio::test]
    async fn test_empty_round_is_empty() {
        let dispatcher = Dispatcher::new(Arc::new(CredentialStore::default())).expect("client");
        assert!(dispatcher.dispatch("Hello", &[]).await.is_empty());
    }

    #[test]
    fn test_view_tags_error_kind() {
        let outcome = DispatchOutcome {
            model_id: 7,
            model_name: "m".into(),
            result: Err(DispatchError::CredentialMissing {
                credential: "KEY1".into(),
            }),
        };
        let v = serde_json::to_value(outcome.view()).expect("serialize");
        assert_eq!(v["kind"], "error");
        assert_eq!(v["error_kind"], "credential_missing");
        assert_eq!(v["model_id"], 7);
        assert!(outcome.display_text().starts_with("ERROR:"));
    }
}
