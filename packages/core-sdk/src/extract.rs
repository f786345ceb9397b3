use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Cause, SolutionCategory, Symptom};

static ARRAY_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("array span regex"));
static OBJECT_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("object span regex"));

/**
 * \brief 从模型回复中提取 JSON 失败的原因。
 */
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON {0} found in response")]
    NoMatch(&'static str),
    #[error("invalid JSON in response: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/**
 * \brief 取回复中第一个 `[` 到其后最后一个 `]` 之间的片段并按 JSON 解析。
 * \details 模型不保证只输出 JSON，因此不要求整段回复都是 JSON。
 */
pub fn extract_json_array(reply: &str) -> Result<Value, ParseError> {
    let span = ARRAY_SPAN
        .find(reply)
        .ok_or(ParseError::NoMatch("array"))?;
    Ok(serde_json::from_str(span.as_str())?)
}

/**
 * \brief 同 `extract_json_array`，匹配 `{...}` 对象片段。
 */
pub fn extract_json_object(reply: &str) -> Result<Value, ParseError> {
    let span = OBJECT_SPAN
        .find(reply)
        .ok_or(ParseError::NoMatch("object"))?;
    Ok(serde_json::from_str(span.as_str())?)
}

/**
 * \brief 逐条解析的结果；无法识别的条目被跳过，`skipped` 记录原因。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub items: Vec<T>,
    pub skipped: Vec<String>,
}

/**
 * \brief 数组中的条目各自解析，单条失败只丢弃该条。
 * \details 数组非空但没有一条可用时整体失败，错误取第一条的原因。
 */
fn parse_entries<T: DeserializeOwned>(value: Value, what: &str) -> Result<Parsed<T>, ParseError> {
    let Value::Array(entries) = value else {
        return Err(ParseError::Shape(format!("expected `{}` to be an array", what)));
    };
    let mut items = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();
    for entry in entries {
        match serde_json::from_value::<T>(entry) {
            Ok(item) => items.push(item),
            Err(e) => skipped.push(e.to_string()),
        }
    }
    if items.is_empty() {
        if let Some(first) = skipped.into_iter().next() {
            return Err(ParseError::Shape(first));
        }
        return Ok(Parsed {
            items,
            skipped: Vec::new(),
        });
    }
    Ok(Parsed { items, skipped })
}

fn take_field(value: Value, key: &str) -> Result<Value, ParseError> {
    match value {
        Value::Object(mut map) => map
            .remove(key)
            .ok_or_else(|| ParseError::Shape(format!("missing field `{}`", key))),
        _ => Err(ParseError::Shape(format!("expected an object with `{}`", key))),
    }
}

/**
 * \brief 解析症状提取结果（JSON 数组）。
 */
pub fn parse_symptoms(reply: &str) -> Result<Parsed<Symptom>, ParseError> {
    parse_entries(extract_json_array(reply)?, "symptoms")
}

/**
 * \brief 解析病因分析结果（键为 `causes` 的对象）。
 */
pub fn parse_causes(reply: &str) -> Result<Parsed<Cause>, ParseError> {
    let causes = take_field(extract_json_object(reply)?, "causes")?;
    parse_entries(causes, "causes")
}

/**
 * \brief 解析治疗方案结果（键为 `solutions` 的对象），以分类为单位跳过。
 */
pub fn parse_solutions(reply: &str) -> Result<Parsed<SolutionCategory>, ParseError> {
    let solutions = take_field(extract_json_object(reply)?, "solutions")?;
    parse_entries(solutions, "solutions")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Probability, SolutionKind, SymptomSeverity, Urgency};
    use serde_json::json;

    #[test]
    fn test_array_found_inside_prose() {
        let reply = "Here you go:\n[{\"a\": 1}, {\"a\": 2}]\nLet me know.";
        let value = extract_json_array(reply).expect("array");
        assert_eq!(value, json!([{"a": 1}, {"a": 2}]));
    }

    #[test]
    fn test_object_spans_multiple_lines() {
        let reply = "Result:\n{\n  \"causes\": []\n}\n";
        let value = extract_json_object(reply).expect("object");
        assert_eq!(value, json!({"causes": []}));
    }

    #[test]
    fn test_missing_span_is_no_match() {
        assert!(matches!(
            extract_json_array("no structured data here"),
            Err(ParseError::NoMatch("array"))
        ));
        assert!(matches!(
            extract_json_object("still nothing ] ["),
            Err(ParseError::NoMatch("object"))
        ));
    }

    #[test]
    fn test_malformed_span_is_invalid_json() {
        let result = extract_json_object("{causes: oops}");
        assert!(matches!(result, Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_two_spans_are_joined_into_one_invalid_match() {
        // First `[` to last `]`, so separate arrays do not parse.
        let result = extract_json_array("[1] and also [2]");
        assert!(matches!(result, Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_parse_symptoms_reads_fields() {
        let reply = r#"[{"symptom":"Low hemoglobin","severity":"moderate","source":"Hemoglobin: 8.2 g/dL"}]"#;
        let parsed = parse_symptoms(reply).expect("symptoms");
        assert!(parsed.skipped.is_empty());
        let symptoms = parsed.items;
        assert_eq!(symptoms.len(), 1);
        assert_eq!(symptoms[0].name, "Low hemoglobin");
        assert_eq!(symptoms[0].severity, SymptomSeverity::Moderate);
        assert_eq!(symptoms[0].source, "Hemoglobin: 8.2 g/dL");
    }

    #[test]
    fn test_parse_causes_accepts_capitalized_enums() {
        let reply = r#"Analysis: {"causes":[{"condition":"Iron deficiency anemia","probability":"High","explanation":"Low Hb","urgency":"Soon"}]}"#;
        let causes = parse_causes(reply).expect("causes").items;
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].probability, Probability::High);
        assert_eq!(causes[0].urgency, Urgency::Soon);
    }

    #[test]
    fn test_parse_causes_without_key_is_shape_error() {
        let result = parse_causes(r#"{"conditions": []}"#);
        assert!(matches!(result, Err(ParseError::Shape(_))));
    }

    #[test]
    fn test_parse_solutions_reads_treatments() {
        let reply = r#"{"solutions":[{"category":"Ayurvedic","treatments":[{"name":"Ashwagandha","description":"Adaptogen","source":"NIH","sourceUrl":"https://example.org/a","questions":["Dosage?"]}]}]}"#;
        let solutions = parse_solutions(reply).expect("solutions").items;
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0].category, SolutionKind::Ayurvedic);
        let treatment = &solutions[0].treatments[0];
        assert_eq!(treatment.name, "Ashwagandha");
        assert_eq!(treatment.source_url, "https://example.org/a");
        assert_eq!(treatment.questions, vec!["Dosage?".to_string()]);
    }

    #[test]
    fn test_symptom_severity_casing_does_not_fail_extraction() {
        let reply = r#"[{"symptom":"Fatigue","severity":"mIlD","source":"tired"},{"symptom":"Pallor","severity":"Mild ","source":"pale"}]"#;
        let parsed = parse_symptoms(reply).expect("symptoms");
        assert!(parsed.skipped.is_empty());
        assert_eq!(parsed.items.len(), 2);
        assert!(parsed
            .items
            .iter()
            .all(|s| s.severity == SymptomSeverity::Mild));
    }

    #[test]
    fn test_unknown_value_drops_only_that_entry() {
        let reply = r#"[{"symptom":"Fatigue","severity":"mild","source":"tired"},{"symptom":"Dyspnea","severity":"moderate-severe","source":"short of breath"}]"#;
        let parsed = parse_symptoms(reply).expect("symptoms");
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].name, "Fatigue");
        assert_eq!(parsed.skipped.len(), 1);
        assert!(parsed.skipped[0].contains("moderate-severe"));
    }

    #[test]
    fn test_all_entries_unusable_is_shape_error() {
        let reply = r#"{"causes":[{"condition":"Anemia","probability":"likely","explanation":"","urgency":"soon"}]}"#;
        let result = parse_causes(reply);
        assert!(matches!(result, Err(ParseError::Shape(ref m)) if m.contains("likely")));
    }

    #[test]
    fn test_empty_array_is_not_an_error() {
        let parsed = parse_symptoms("[]").expect("empty");
        assert!(parsed.items.is_empty());
        assert!(parsed.skipped.is_empty());
    }

    #[test]
    fn test_unknown_category_skips_that_category() {
        let reply = r#"{"solutions":[{"category":"Folk","treatments":[]},{"category":" allopathic","treatments":[{"name":"Ferrous sulfate"}]}]}"#;
        let parsed = parse_solutions(reply).expect("solutions");
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].category, SolutionKind::Allopathic);
        assert_eq!(parsed.skipped.len(), 1);
    }
}
