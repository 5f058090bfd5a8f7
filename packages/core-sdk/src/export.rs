use std::{path::Path, str::FromStr};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::DispatchOutcome;
use crate::models::StoredResult;

/**
 * \brief 导出格式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Markdown => "md",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            other => Err(anyhow!("unsupported export format: {}", other)),
        }
    }
}

/**
 * \brief 导出中的一条模型回复。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub model_name: String,
    pub response: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExportEntry {
    /**
     * \brief 由分发结果构建；失败结果以错误文本作为正文，元数据为空。
     */
    pub fn from_outcome(outcome: &DispatchOutcome) -> Self {
        let metadata = outcome
            .reply()
            .and_then(|r| serde_json::to_value(&r.metadata).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        Self {
            model_id: Some(outcome.model_id),
            model_name: outcome.model_name.clone(),
            response: outcome.display_text(),
            metadata,
        }
    }

    pub fn from_stored(result: &StoredResult) -> Self {
        let metadata = match &result.metadata {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        Self {
            model_id: Some(result.model_id),
            model_name: result
                .model_name
                .clone()
                .unwrap_or_else(|| format!("model {}", result.model_id)),
            response: result.response.clone(),
            metadata,
        }
    }
}

/**
 * \brief 导出文档：提示词 + 各模型回复。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub prompt: String,
    pub results: Vec<ExportEntry>,
}

impl ExportDocument {
    pub fn from_outcomes(prompt: &str, outcomes: &[DispatchOutcome]) -> Self {
        Self {
            prompt: prompt.trim().to_string(),
            results: outcomes.iter().map(ExportEntry::from_outcome).collect(),
        }
    }
}

/**
 * \brief 渲染为带标题层级的 Markdown 文本。
 * \details 标题与提示模板一致使用俄语。
 */
pub fn to_markdown(doc: &ExportDocument) -> String {
    let mut out = String::from("# Результаты сравнения нейросетей\n\n");
    if !doc.prompt.is_empty() {
        out.push_str(&format!("## Промт\n\n{}\n\n", doc.prompt));
    }
    out.push_str("## Ответы\n\n");
    for (i, entry) in doc.results.iter().enumerate() {
        out.push_str(&format!("### {}. {}\n\n", i + 1, entry.model_name));
        out.push_str(&format!("{}\n\n", entry.response));
        if !entry.metadata.is_empty() {
            out.push_str("**Метаданные:**\n");
            for (key, value) in &entry.metadata {
                out.push_str(&format!("- {}: {}\n", key, display_value(value)));
            }
            out.push('\n');
        }
    }
    out
}

/**
 * \brief 直接序列化为缩进 JSON。
 */
pub fn to_json(doc: &ExportDocument) -> Result<String> {
    serde_json::to_string_pretty(doc).context("serialize export failed")
}

pub fn render(doc: &ExportDocument, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Markdown => Ok(to_markdown(doc)),
        ExportFormat::Json => to_json(doc),
    }
}

pub fn write_to(path: &Path, doc: &ExportDocument, format: ExportFormat) -> Result<()> {
    let body = render(doc, format)?;
    std::fs::write(path, body).with_context(|| format!("write {} failed", path.display()))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
