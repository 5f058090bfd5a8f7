use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dispatch::Dispatcher;
use crate::error::ImproveError;
use crate::llm::ResponseMetadata;
use crate::models::ModelConfig;
use crate::telemetry;

/** \brief 主建议与备选之间的分隔符。 */
pub const VARIANTS_SEPARATOR: &str = "---ВАРИАНТЫ---";
const VARIANTS_SEPARATOR_EN: &str = "---VARIANTS---";

/** \brief 备选条数上限。 */
pub const MAX_ALTERNATIVES: usize = 3;
/** \brief 按行回退解析时，长度不超过该值的行视为噪声。 */
const MIN_LINE_ALTERNATIVE_CHARS: usize = 10;

const IMPROVEMENT_TEMPLATE: &str = r#"Ты эксперт по улучшению промптов для AI. Проанализируй следующий промпт и улучши его.

Исходный промпт:
{prompt}

Задача: Улучши этот промпт, сделав его более четким, конкретным и эффективным. Верни улучшенную версию промпта.

Формат ответа:
1. Улучшенная версия промпта (основной ответ)
2. Затем напиши "---ВАРИАНТЫ---" и после этого 2-3 альтернативных варианта переформулировки, каждый с новой строки, начинающийся с "Вариант N:"

Улучшенная версия:"#;

const REFORMULATION_TEMPLATE: &str = r#"Ты эксперт по переформулировке текста. Переформулируй следующий промпт, сохранив его смысл, но изменив формулировку.

Исходный промпт:
{prompt}

Верни 3 варианта переформулировки, каждый с новой строки, начинающийся с "Вариант N:"
Варианты:"#;

const CODE_ADAPTATION_TEMPLATE: &str = r#"Ты эксперт по написанию промптов для программирования и работы с кодом. Адаптируй следующий промпт для задач, связанных с программированием.

Исходный промпт:
{prompt}

Адаптируй промпт для работы с кодом, добавь конкретику, требования к формату ответа (код, объяснения, примеры). Верни улучшенную версию.

Улучшенная версия:"#;

const ANALYSIS_ADAPTATION_TEMPLATE: &str = r#"Ты эксперт по написанию промптов для аналитических задач. Адаптируй следующий промпт для задач анализа данных, текста или информации.

Исходный промпт:
{prompt}

Адаптируй промпт для аналитических задач, добавь требования к структуре ответа, глубине анализа, формату вывода. Верни улучшенную версию.

Улучшенная версия:"#;

const CREATIVE_ADAPTATION_TEMPLATE: &str = r#"Ты эксперт по написанию промптов для креативных задач. Адаптируй следующий промпт для творческих задач (написание текстов, генерация идей, креативные решения).

Исходный промпт:
{prompt}

Адаптируй промпт для креативных задач, добавь требования к стилю, тону, формату творческого ответа. Верни улучшенную версию.

Улучшенная версия:"#;

static VARIANT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Вариант|Variant)\s+\d+[.:]").expect("Invalid variant marker regex")
});

static LEADING_VARIANT_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:Вариант|Variant)\s+\d+[.:]\s*").expect("Invalid variant label regex")
});

static IMPROVED_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:Улучшенная\s+версия|Improved\s+version)[.:]?\s*")
        .expect("Invalid improved label regex")
});

static ANSWER_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:Ответ|Answer)[.:]?\s*").expect("Invalid answer label regex")
});

/**
 * \brief 改写结果：主建议 + 至多 3 条备选。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementResult {
    pub improved: String,
    pub alternatives: Vec<String>,
}

/**
 * \brief `improve` 的完整返回，附带调用元数据。
 */
#[derive(Debug, Clone, Serialize)]
pub struct Improvement {
    #[serde(flatten)]
    pub result: ImprovementResult,
    pub metadata: ResponseMetadata,
}

/**
 * \brief 三个方向的适配结果；单个方向失败时其文本为 "Ошибка: ..."。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adaptations {
    pub code: String,
    pub analysis: String,
    pub creative: String,
}

/**
 * \brief 适配方向。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationKind {
    Code,
    Analysis,
    Creative,
}

impl AdaptationKind {
    pub const ALL: [AdaptationKind; 3] = [
        AdaptationKind::Code,
        AdaptationKind::Analysis,
        AdaptationKind::Creative,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AdaptationKind::Code => "code",
            AdaptationKind::Analysis => "analysis",
            AdaptationKind::Creative => "creative",
        }
    }

    fn template(self) -> &'static str {
        match self {
            AdaptationKind::Code => CODE_ADAPTATION_TEMPLATE,
            AdaptationKind::Analysis => ANALYSIS_ADAPTATION_TEMPLATE,
            AdaptationKind::Creative => CREATIVE_ADAPTATION_TEMPLATE,
        }
    }
}

/**
 * \brief 提示词改写流水线，复用分发引擎的单模型调用原语。
 */
#[derive(Clone, Debug)]
pub struct PromptImprover {
    dispatcher: Dispatcher,
}

impl PromptImprover {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /**
     * \brief 改写提示词并解析出主建议与备选。
     */
    pub async fn improve(
        &self,
        original: &str,
        model: &ModelConfig,
    ) -> Result<Improvement, ImproveError> {
        ensure_not_empty(original)?;
        let request = fill_template(IMPROVEMENT_TEMPLATE, original);
        let reply = self
            .dispatcher
            .send_one(model, &request)
            .await
            .inspect_err(|e| {
                telemetry::log_warn(
                    "improver",
                    &format!("improve failed model={} kind={}", model.name, e.kind()),
                )
            })?;
        let result = parse_improvement_response(&reply.response);
        telemetry::log_event(
            "improver",
            &format!(
                "improve ok model={} alternatives={}",
                model.name,
                result.alternatives.len()
            ),
        );
        Ok(Improvement {
            result,
            metadata: reply.metadata,
        })
    }

    /**
     * \brief 获取三种方向的适配版本，三次调用并发执行且互不影响。
     */
    pub async fn adaptations(
        &self,
        original: &str,
        model: &ModelConfig,
    ) -> Result<Adaptations, ImproveError> {
        ensure_not_empty(original)?;
        let (code, analysis, creative) = tokio::join!(
            self.adapt(AdaptationKind::Code, original, model),
            self.adapt(AdaptationKind::Analysis, original, model),
            self.adapt(AdaptationKind::Creative, original, model),
        );
        Ok(Adaptations {
            code,
            analysis,
            creative,
        })
    }

    /**
     * \brief 单个方向的适配；失败时返回带 "Ошибка:" 前缀的文本而不是错误。
     */
    pub async fn adapt(&self, kind: AdaptationKind, original: &str, model: &ModelConfig) -> String {
        let request = fill_template(kind.template(), original);
        match self.dispatcher.send_one(model, &request).await {
            Ok(reply) => extract_main_response(&reply.response),
            Err(err) => {
                telemetry::log_warn(
                    "improver",
                    &format!(
                        "adaptation {} failed model={} kind={}",
                        kind.label(),
                        model.name,
                        err.kind()
                    ),
                );
                format!("Ошибка: {}", err)
            }
        }
    }

    /**
     * \brief 获取至多 3 条同义改写。
     */
    pub async fn reformulate(
        &self,
        original: &str,
        model: &ModelConfig,
    ) -> Result<Vec<String>, ImproveError> {
        ensure_not_empty(original)?;
        let request = fill_template(REFORMULATION_TEMPLATE, original);
        let reply = self.dispatcher.send_one(model, &request).await?;
        Ok(parse_variant_list(reply.response.trim()))
    }
}

fn ensure_not_empty(original: &str) -> Result<(), ImproveError> {
    if original.trim().is_empty() {
        return Err(ImproveError::EmptyPrompt);
    }
    Ok(())
}

fn fill_template(template: &str, prompt: &str) -> String {
    template.replace("{prompt}", prompt)
}

/**
 * \brief 解析改写回复。
 * \details 1. 去除首尾空白；2. 若含分隔符，按首次出现拆分；
 *          3. 否则若出现带正文的 "Вариант N:"，其之前为主建议，之后为备选块；
 *          4. 去掉主建议开头的 "Улучшенная версия:"；
 *          5. 从备选块提取各 "Вариант N:" 段，提取不到时按行拆分并丢弃过短的行；
 *          6. 至多保留 3 条。
 *          无任何标记时整段文本即主建议，备选为空。
 */
pub fn parse_improvement_response(response: &str) -> ImprovementResult {
    let response = response.trim();

    let (improved, alternatives_block) = if let Some((head, tail)) = split_on_separator(response) {
        (head.trim(), tail.trim())
    } else if let Some(first) = VARIANT_MARKER
        .find(response)
        .filter(|m| !extract_variants(&response[m.start()..]).is_empty())
    {
        (response[..first.start()].trim(), &response[first.start()..])
    } else {
        (response, "")
    };

    let improved = IMPROVED_LABEL.replace(improved, "").trim().to_string();

    let mut alternatives = if alternatives_block.is_empty() {
        Vec::new()
    } else {
        parse_variant_list(alternatives_block)
    };
    alternatives.truncate(MAX_ALTERNATIVES);

    ImprovementResult {
        improved,
        alternatives,
    }
}

/**
 * \brief 清理适配回复：去掉开头的 "Улучшенная версия:" 或 "Ответ:"，不拆分备选。
 */
pub fn extract_main_response(response: &str) -> String {
    let response = response.trim();
    let response = IMPROVED_LABEL.replace(response, "");
    let response = ANSWER_LABEL.replace(&response, "");
    response.trim().to_string()
}

fn split_on_separator(text: &str) -> Option<(&str, &str)> {
    [VARIANTS_SEPARATOR, VARIANTS_SEPARATOR_EN]
        .iter()
        .filter_map(|sep| text.find(sep).map(|pos| (pos, sep.len())))
        .min_by_key(|(pos, _)| *pos)
        .map(|(pos, len)| (&text[..pos], &text[pos + len..]))
}

fn parse_variant_list(block: &str) -> Vec<String> {
    let mut variants = extract_variants(block);
    if variants.is_empty() {
        variants = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| LEADING_VARIANT_LABEL.replace(line, "").trim().to_string())
            .filter(|line| line.chars().count() > MIN_LINE_ALTERNATIVE_CHARS)
            .collect();
    }
    variants.truncate(MAX_ALTERNATIVES);
    variants
}

/** \brief 每段 "Вариант N:" 的正文延伸到下一个标记或文本末尾。 */
fn extract_variants(block: &str) -> Vec<String> {
    let markers: Vec<(usize, usize)> = VARIANT_MARKER
        .find_iter(block)
        .map(|m| (m.start(), m.end()))
        .collect();
    markers
        .iter()
        .enumerate()
        .filter_map(|(i, &(_, body_start))| {
            let body_end = markers.get(i + 1).map(|m| m.0).unwrap_or(block.len());
            let text = block[body_start..body_end].trim();
            (!text.is_empty()).then(|| text.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separator_with_three_variants() {
        let text = "Улучшенная версия: Напиши подробный план проекта\n---ВАРИАНТЫ---\nВариант 1: Составь план проекта\nВариант 2: Опиши шаги проекта\nВариант 3: Дай дорожную карту проекта";
        let parsed = parse_improvement_response(text);
        assert_eq!(parsed.improved, "Напиши подробный план проекта");
        assert_eq!(
            parsed.alternatives,
            vec![
                "Составь план проекта",
                "Опиши шаги проекта",
                "Дай дорожную карту проекта"
            ]
        );
    }

    #[test]
    fn test_parse_is_stable_on_reparse_of_primary() {
        let text = "Better prompt\n---VARIANTS---\nVariant 1: one option here\nVariant 2: two option here\nVariant 3: three option here";
        let first = parse_improvement_response(text);
        let again = parse_improvement_response(&first.improved);
        assert_eq!(first.improved, "Better prompt");
        assert_eq!(again.improved, first.improved);
        assert!(again.alternatives.is_empty());
    }

    #[test]
    fn test_no_markers_yields_whole_text() {
        let text = "  Просто улучшенный промпт без вариантов.\nВторая строка.  ";
        let parsed = parse_improvement_response(text);
        assert_eq!(
            parsed.improved,
            "Просто улучшенный промпт без вариантов.\nВторая строка."
        );
        assert!(parsed.alternatives.is_empty());
    }

    #[test]
    fn test_trailing_bare_marker_keeps_whole_text() {
        let text = "Основной текст промпта\nВариант 1:";
        let parsed = parse_improvement_response(text);
        assert_eq!(parsed.improved, "Основной текст промпта\nВариант 1:");
        assert!(parsed.alternatives.is_empty());
    }

    #[test]
    fn test_inline_variants_without_separator() {
        let text = "Главный вариант текста\nвариант 1. Первый\nВАРИАНТ 2: Второй";
        let parsed = parse_improvement_response(text);
        assert_eq!(parsed.improved, "Главный вариант текста");
        assert_eq!(parsed.alternatives, vec!["Первый", "Второй"]);
    }

    #[test]
    fn test_alternatives_truncated_to_three() {
        let text = "P\n---ВАРИАНТЫ---\nВариант 1: a\nВариант 2: b\nВариант 3: c\nВариант 4: d\nВариант 5: e";
        let parsed = parse_improvement_response(text);
        assert_eq!(parsed.alternatives, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_line_fallback_discards_short_lines() {
        let text = "Основной\n---ВАРИАНТЫ---\n- коротко\n- достаточно длинная строка\n\n- ещё одна длинная строка";
        let parsed = parse_improvement_response(text);
        assert_eq!(
            parsed.alternatives,
            vec!["- достаточно длинная строка", "- ещё одна длинная строка"]
        );
    }

    #[test]
    fn test_line_fallback_keeps_only_over_ten_chars() {
        let text = "P\n---VARIANTS---\n0123456789\n0123456789A";
        let parsed = parse_improvement_response(text);
        assert_eq!(parsed.alternatives, vec!["0123456789A"]);
    }

    #[test]
    fn test_extract_main_response_strips_labels() {
        assert_eq!(
            extract_main_response("  Улучшенная версия: Текст для кода "),
            "Текст для кода"
        );
        assert_eq!(extract_main_response("ответ. Итог"), "Итог");
        assert_eq!(
            extract_main_response("Improved version: keep ---ВАРИАНТЫ--- as is"),
            "keep ---ВАРИАНТЫ--- as is"
        );
    }

    #[test]
    fn test_fill_template_inserts_prompt() {
        let filled = fill_template(CODE_ADAPTATION_TEMPLATE, "сортировка массива");
        assert!(filled.contains("Исходный промпт:\nсортировка массива\n"));
        assert!(!filled.contains("{prompt}"));
    }
}
