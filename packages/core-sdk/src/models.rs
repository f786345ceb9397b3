use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;

/**
 * \brief 消息角色，与 Anthropic Messages 格式对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/**
 * \brief base64 内容来源。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base64Source {
    /** \brief 固定为 "base64" */
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl Base64Source {
    pub fn new(media_type: &str, data: String) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.to_string(),
            data,
        }
    }
}

/**
 * \brief 消息内容块：文本、图片或 PDF 文档。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: Base64Source },
    Document { source: Base64Source },
}

/**
 * \brief 消息内容：纯文本或内容块数组。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/**
 * \brief 单条对话消息。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: Content,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }

    /**
     * \brief 文本内容；内容块形式时拼接其中的文本块。
     */
    pub fn text(&self) -> String {
        match &self.content {
            Content::Text(t) => t.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/**
 * \brief 发往中继服务的请求体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub api_key: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/**
 * \brief token 用量。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/**
 * \brief 中继调用成功后的模型回复。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReply {
    pub text: String,
    pub usage: Usage,
}

/**
 * \brief 模型输出中无法识别的枚举取值。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

/**
 * \brief 为模型输出的枚举生成 `as_str`、`FromStr` 与 `Deserialize`。
 * \details 取值先去掉首尾空白再按 ASCII 忽略大小写匹配。
 */
macro_rules! model_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownValue {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(de::Error::custom)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SymptomSeverity {
    Mild,
    Moderate,
    Severe,
}

model_enum!(SymptomSeverity, "severity", {
    Mild => "mild",
    Moderate => "moderate",
    Severe => "severe",
});

/**
 * \brief 从报告中提取出的症状。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symptom {
    /** \brief 症状名称（去重键） */
    #[serde(rename = "symptom", alias = "name")]
    pub name: String,
    pub severity: SymptomSeverity,
    /** \brief 原文出处 */
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Probability {
    High,
    Medium,
    Low,
}

model_enum!(Probability, "probability", {
    High => "high",
    Medium => "medium",
    Low => "low",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Immediate,
    Soon,
    Routine,
}

model_enum!(Urgency, "urgency", {
    Immediate => "immediate",
    Soon => "soon",
    Routine => "routine",
});

/**
 * \brief 可能病因。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cause {
    pub condition: String,
    pub probability: Probability,
    #[serde(default)]
    pub explanation: String,
    pub urgency: Urgency,
}

/**
 * \brief 治疗体系分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SolutionKind {
    Ayurvedic,
    Homeopathic,
    Allopathic,
    Naturopathic,
}

model_enum!(SolutionKind, "category", {
    Ayurvedic => "ayurvedic",
    Homeopathic => "homeopathic",
    Allopathic => "allopathic",
    Naturopathic => "naturopathic",
});

impl SolutionKind {
    pub const ALL: [SolutionKind; 4] = [
        SolutionKind::Ayurvedic,
        SolutionKind::Homeopathic,
        SolutionKind::Allopathic,
        SolutionKind::Naturopathic,
    ];
}

impl fmt::Display for SolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SolutionKind::Ayurvedic => "Ayurvedic",
            SolutionKind::Homeopathic => "Homeopathic",
            SolutionKind::Allopathic => "Allopathic",
            SolutionKind::Naturopathic => "Naturopathic",
        };
        f.write_str(label)
    }
}

/**
 * \brief 治疗方案的稳定标识，由控制器分配，不来自模型输出。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreatmentId(pub u64);

impl fmt::Display for TreatmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/**
 * \brief 单个治疗方案，同时也是一个追问对话主题。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treatment {
    #[serde(skip)]
    pub id: TreatmentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /** \brief 出处名称 */
    #[serde(default)]
    pub source: String,
    /** \brief 出处链接 */
    #[serde(default, rename = "sourceUrl", alias = "source_url", alias = "url")]
    pub source_url: String,
    /** \brief 推荐追问 */
    #[serde(default)]
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionCategory {
    pub category: SolutionKind,
    #[serde(default)]
    pub treatments: Vec<Treatment>,
}

/**
 * \brief 针对某个治疗方案的追问会话，仅存在于内存。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSession {
    pub topic: TreatmentId,
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_values_ignore_case_and_padding() {
        let severity: SymptomSeverity = serde_json::from_value(json!("mIlD")).expect("mixed case");
        assert_eq!(severity, SymptomSeverity::Mild);
        let severity: SymptomSeverity = serde_json::from_value(json!("Mild ")).expect("padded");
        assert_eq!(severity, SymptomSeverity::Mild);
        assert_eq!(" HIGH".parse::<Probability>(), Ok(Probability::High));
        assert_eq!("Routine\n".parse::<Urgency>(), Ok(Urgency::Routine));
        assert_eq!(
            "naturopathic".parse::<SolutionKind>(),
            Ok(SolutionKind::Naturopathic)
        );
    }

    #[test]
    fn test_unknown_enum_value_names_the_field() {
        let err = "moderate-severe".parse::<SymptomSeverity>().unwrap_err();
        assert_eq!(err.kind, "severity");
        assert_eq!(err.value, "moderate-severe");
        let err = serde_json::from_value::<Urgency>(json!("whenever")).unwrap_err();
        assert!(err.to_string().contains("unknown urgency value"));
    }

    #[test]
    fn test_enums_serialize_in_lowercase() {
        assert_eq!(serde_json::to_value(SymptomSeverity::Severe).expect("ser"), json!("severe"));
        assert_eq!(Probability::Medium.as_str(), "medium");
        assert_eq!(SolutionKind::Allopathic.to_string(), "Allopathic");
    }
}
