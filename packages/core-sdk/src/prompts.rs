use crate::document::Document;
use crate::models::{
    Cause, Content, ContentBlock, Message, Role, SolutionKind, Symptom, Treatment,
};

/**
 * \brief 某一次请求的系统指令与消息列表。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePrompt {
    pub system: String,
    pub messages: Vec<Message>,
}

const INGEST_SYSTEM: &str = "You are a medical document assistant. Read the provided medical \
document (lab report, prescription, discharge summary or clinical notes) and extract the \
structured medical information it contains: patient details, test names with values, units and \
reference ranges, flagged abnormal results, diagnoses, medications and clinician notes. \
Reply in plain text only. Do not add interpretation that is not in the document.";

const INGEST_REQUEST: &str = "Extract the structured medical information from this document.";

const SYMPTOM_SYSTEM: &str = "You are a medical analysis assistant. From the medical text, \
identify every symptom or abnormal finding. Return ONLY a JSON array, with no other text, \
in exactly this shape:\n\
[{\"symptom\": \"short name\", \"severity\": \"mild|moderate|severe\", \"source\": \"exact text it came from\"}]";

const CAUSE_SYSTEM: &str = "You are a medical analysis assistant. Given the confirmed symptoms, \
list the possible underlying causes. Return ONLY a JSON object, with no other text, in exactly \
this shape:\n\
{\"causes\": [{\"condition\": \"name\", \"probability\": \"high|medium|low\", \
\"explanation\": \"why the symptoms point to it\", \"urgency\": \"immediate|soon|routine\"}]}";

/**
 * \brief 治疗方案指令；分类列表取自 `SolutionKind::ALL`，与解析端接受的取值一致。
 */
fn solution_system() -> String {
    let names = SolutionKind::ALL.map(|k| k.to_string());
    format!(
        "You are a medical information assistant. For the possible causes given, suggest \
treatment options from {} traditions: {}. Cite a reputable source for each treatment. Return \
ONLY a JSON object, with no other text, in exactly this shape:\n\
{{\"solutions\": [{{\"category\": \"{}\", \"treatments\": [{{\"name\": \"treatment\", \
\"description\": \"what it is and how it helps\", \"source\": \"source name\", \
\"sourceUrl\": \"https://...\", \"questions\": [\"a follow-up question the patient might ask\"]}}]}}]}}",
        names.len(),
        names.join(", "),
        names.join("|")
    )
}

/**
 * \brief 文档解析：把上传的文档原样交给模型，回复全文即为提取结果。
 */
pub fn ingest_document(document: &Document) -> StagePrompt {
    let content = match document {
        Document::Text(text) => Content::Text(format!("{}\n\n{}", INGEST_REQUEST, text)),
        _ => Content::Blocks(vec![
            document.to_block(),
            ContentBlock::Text {
                text: INGEST_REQUEST.to_string(),
            },
        ]),
    };
    StagePrompt {
        system: INGEST_SYSTEM.to_string(),
        messages: vec![Message {
            role: Role::User,
            content,
        }],
    }
}

pub fn extract_symptoms(source_text: &str) -> StagePrompt {
    StagePrompt {
        system: SYMPTOM_SYSTEM.to_string(),
        messages: vec![Message::user(format!(
            "Medical text:\n\n{}",
            source_text.trim()
        ))],
    }
}

/**
 * \brief 病因分析：确认的症状与补充描述取并集，同名（忽略大小写）只保留一次。
 */
pub fn analyze_causes(confirmed: &[Symptom], additional: &str) -> StagePrompt {
    let mut lines: Vec<String> = confirmed
        .iter()
        .map(|s| {
            let severity = s.severity.as_str();
            if s.source.is_empty() {
                format!("- {} ({})", s.name, severity)
            } else {
                format!("- {} ({}); from: {}", s.name, severity, s.source)
            }
        })
        .collect();
    for extra in split_additional(additional) {
        let duplicate = confirmed
            .iter()
            .any(|s| s.name.trim().eq_ignore_ascii_case(extra));
        if !duplicate {
            lines.push(format!("- {}", extra));
        }
    }
    StagePrompt {
        system: CAUSE_SYSTEM.to_string(),
        messages: vec![Message::user(format!(
            "Confirmed symptoms:\n{}",
            lines.join("\n")
        ))],
    }
}

pub fn find_solutions(causes: &[Cause]) -> StagePrompt {
    let lines = causes
        .iter()
        .map(|c| format!("- {}: {}", c.condition, c.explanation))
        .collect::<Vec<_>>()
        .join("\n");
    StagePrompt {
        system: solution_system(),
        messages: vec![Message::user(format!("Possible causes:\n{}", lines))],
    }
}

/**
 * \brief 追问对话：治疗方案信息放在系统指令里，历史消息原样回放。
 */
pub fn chat(treatment: &Treatment, history: &[Message]) -> StagePrompt {
    let system = format!(
        "You are a helpful medical information assistant answering questions about a specific \
treatment.\nTreatment: {}\nDescription: {}\nSource: {}\nAnswer clearly and concisely, and remind \
the user to consult a qualified practitioner before starting any treatment.",
        treatment.name, treatment.description, treatment.source_url
    );
    StagePrompt {
        system,
        messages: history.to_vec(),
    }
}

/**
 * \brief 补充症状按换行或逗号切分，去掉空项。
 */
pub fn split_additional(additional: &str) -> Vec<&str> {
    additional
        .split(|c: char| c == '\n' || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
