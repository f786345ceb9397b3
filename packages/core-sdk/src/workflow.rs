use std::collections::{BTreeSet, HashMap};
use std::fmt;

use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::document::Document;
use crate::extract;
use crate::models::{
    Cause, ChatSession, Message, RelayReply, RelayRequest, Role, SolutionCategory, Symptom,
    Treatment, TreatmentId,
};
use crate::prompts::{self, StagePrompt};

/**
 * \brief 主流程的四个阶段，顺序推进。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Upload,
    Symptoms,
    Causes,
    Solutions,
}

/**
 * \brief 与流程正交的视图，切换不影响流程数据。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Workflow,
    Settings,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogSeverity::Info => "info",
            LogSeverity::Success => "success",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLogEntry {
    pub timestamp: OffsetDateTime,
    pub message: String,
    pub severity: LogSeverity,
}

impl fmt::Display for DebugLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.to_string());
        write!(f, "{} [{}] {}", ts, self.severity, self.message)
    }
}

/**
 * \brief 只追加的调试日志，仅供观察，不参与流程控制。
 */
#[derive(Debug, Clone, Default)]
pub struct DebugLog {
    entries: Vec<DebugLogEntry>,
}

impl DebugLog {
    pub fn push(&mut self, severity: LogSeverity, message: impl Into<String>) {
        self.entries.push(DebugLogEntry {
            timestamp: OffsetDateTime::now_utc(),
            message: message.into(),
            severity,
        });
    }

    pub fn entries(&self) -> &[DebugLogEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/**
 * \brief 一次模型调用失败的原因。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    #[error("API key is missing; enter it in Settings first")]
    MissingCredential,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("API error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("{stage} failed: {reason}")]
    Parse { stage: &'static str, reason: String },
    #[error("{0}")]
    Validation(String),
    #[error("request timed out after {0}s")]
    TimedOut(u64),
    #[error("request cancelled")]
    Cancelled,
}

/**
 * \brief 请求种类；聊天请求以治疗方案标识区分会话。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    IngestDocument,
    ExtractSymptoms,
    AnalyzeCauses,
    FindSolutions,
    Chat(TreatmentId),
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::IngestDocument => "Document analysis",
            RequestKind::ExtractSymptoms => "Symptom extraction",
            RequestKind::AnalyzeCauses => "Cause analysis",
            RequestKind::FindSolutions => "Solution lookup",
            RequestKind::Chat(_) => "Chat",
        }
    }
}

/**
 * \brief 面向用户的提示。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: LogSeverity,
    pub text: String,
}

/**
 * \brief 需要驱动层执行的副作用：发起一次中继调用。
 */
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: RequestKind,
    pub request: RelayRequest,
}

/**
 * \brief 驱动状态机的消息。
 */
#[derive(Debug, Clone)]
pub enum Msg {
    SetCredential(String),
    ClearCredential,
    ShowView(View),
    GoToStage(Stage),
    SetSourceText(String),
    IngestDocument(Document),
    AnalyzeSymptoms,
    ToggleSymptom(String),
    SetAdditionalSymptoms(String),
    AnalyzeCauses,
    FindSolutions,
    OpenChat(TreatmentId),
    SendChat { topic: TreatmentId, text: String },
    AskRecommended { topic: TreatmentId, index: usize },
    ClearDebugLog,
    DismissNotice,
    RelayCompleted {
        kind: RequestKind,
        outcome: Result<RelayReply, CallFailure>,
    },
}

/**
 * \brief 客户端全部状态，只通过 `update` 修改。
 */
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub stage: Stage,
    pub view: View,
    pub credential: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub source_text: String,
    pub document_summary: Option<String>,
    /** \brief 症状提取结果；`None` 表示尚未提取 */
    pub extracted: Option<Vec<Symptom>>,
    pub confirmed: BTreeSet<String>,
    pub additional_symptoms: String,
    pub causes: Option<Vec<Cause>>,
    pub solutions: Option<Vec<SolutionCategory>>,
    pub chats: HashMap<TreatmentId, ChatSession>,
    pub open_chat: Option<TreatmentId>,
    /** \brief 阶段调用进行中 */
    pub busy: bool,
    /** \brief 聊天发送进行中，独立于 `busy` */
    pub chat_pending: Option<TreatmentId>,
    pub debug_log: DebugLog,
    pub notice: Option<Notice>,
    next_treatment_id: u64,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            stage: Stage::Upload,
            view: View::Workflow,
            credential: None,
            model: None,
            max_tokens: None,
            source_text: String::new(),
            document_summary: None,
            extracted: None,
            confirmed: BTreeSet::new(),
            additional_symptoms: String::new(),
            causes: None,
            solutions: None,
            chats: HashMap::new(),
            open_chat: None,
            busy: false,
            chat_pending: None,
            debug_log: DebugLog::default(),
            notice: None,
            next_treatment_id: 1,
        }
    }
}

impl WorkflowState {
    pub fn new(credential: Option<String>) -> Self {
        Self {
            credential: credential.filter(|c| !c.trim().is_empty()),
            ..Self::default()
        }
    }

    pub fn is_confirmed(&self, name: &str) -> bool {
        self.confirmed.contains(name)
    }

    /**
     * \brief 按提取顺序返回已确认的症状。
     */
    pub fn confirmed_symptoms(&self) -> Vec<Symptom> {
        self.extracted
            .iter()
            .flatten()
            .filter(|s| self.confirmed.contains(&s.name))
            .cloned()
            .collect()
    }

    pub fn treatment(&self, id: TreatmentId) -> Option<&Treatment> {
        self.solutions
            .iter()
            .flatten()
            .flat_map(|c| c.treatments.iter())
            .find(|t| t.id == id)
    }

    pub fn chat(&self, id: TreatmentId) -> Option<&ChatSession> {
        self.chats.get(&id)
    }

    /**
     * \brief 某阶段是否已有数据可供回看。
     */
    pub fn stage_available(&self, stage: Stage) -> bool {
        match stage {
            Stage::Upload => true,
            Stage::Symptoms => self.extracted.is_some(),
            Stage::Causes => self.causes.as_ref().is_some_and(|c| !c.is_empty()),
            Stage::Solutions => self.solutions.is_some(),
        }
    }

    fn notify(&mut self, severity: LogSeverity, text: impl Into<String>) {
        self.notice = Some(Notice {
            severity,
            text: text.into(),
        });
    }

    fn reject(&mut self, failure: CallFailure) {
        let text = failure.to_string();
        self.debug_log.push(LogSeverity::Warning, text.clone());
        self.notify(LogSeverity::Error, text);
    }

    /**
     * \brief 组装调用；无凭据时直接拒绝，不产生命令。
     */
    fn issue(&mut self, kind: RequestKind, prompt: StagePrompt) -> Option<Command> {
        let api_key = match &self.credential {
            Some(key) => key.clone(),
            None => {
                self.reject(CallFailure::MissingCredential);
                return None;
            }
        };
        self.debug_log.push(
            LogSeverity::Info,
            format!(
                "{} request sent ({} message(s))",
                kind.label(),
                prompt.messages.len()
            ),
        );
        Some(Command {
            kind,
            request: RelayRequest {
                api_key,
                messages: prompt.messages,
                system: Some(prompt.system),
                model: self.model.clone(),
                max_tokens: self.max_tokens,
            },
        })
    }

    fn begin_stage(&mut self, kind: RequestKind, prompt: StagePrompt) -> Option<Command> {
        let command = self.issue(kind, prompt);
        if command.is_some() {
            self.busy = true;
            self.notice = None;
        }
        command
    }

    fn fail(&mut self, kind: RequestKind, failure: CallFailure) {
        let text = match &failure {
            CallFailure::Parse { .. } => failure.to_string(),
            _ => format!("{} failed: {}", kind.label(), failure),
        };
        self.debug_log.push(LogSeverity::Error, text.clone());
        self.notify(LogSeverity::Error, text);
        match kind {
            RequestKind::Chat(topic) => {
                self.chat_pending = None;
                if let Some(session) = self.chats.get_mut(&topic) {
                    if session.messages.last().is_some_and(|m| m.role == Role::User) {
                        session.messages.pop();
                    }
                }
            }
            _ => self.busy = false,
        }
    }

    fn has_credential(&mut self) -> bool {
        if self.credential.is_none() {
            self.reject(CallFailure::MissingCredential);
            return false;
        }
        true
    }

    fn stage_idle(&mut self) -> bool {
        if self.busy {
            self.debug_log
                .push(LogSeverity::Warning, "A request is already in progress");
            return false;
        }
        true
    }
}

/**
 * \brief 状态机唯一入口：应用一条消息，必要时返回需执行的调用。
 */
pub fn update(state: &mut WorkflowState, msg: Msg) -> Option<Command> {
    match msg {
        Msg::SetCredential(key) => {
            let key = key.trim().to_string();
            if key.is_empty() {
                state.credential = None;
                state.reject(CallFailure::Validation("API key cannot be empty".to_string()));
            } else {
                state.credential = Some(key);
                state.debug_log.push(LogSeverity::Success, "API key saved");
                state.notify(LogSeverity::Success, "API key saved");
            }
            None
        }
        Msg::ClearCredential => {
            state.credential = None;
            state.debug_log.push(LogSeverity::Info, "API key cleared");
            None
        }
        Msg::ShowView(view) => {
            state.view = view;
            None
        }
        Msg::GoToStage(stage) => {
            if state.stage_available(stage) {
                state.stage = stage;
                state.view = View::Workflow;
            } else {
                state.notify(
                    LogSeverity::Warning,
                    "Complete the previous step before opening this one",
                );
            }
            None
        }
        Msg::SetSourceText(text) => {
            state.source_text = text;
            None
        }
        Msg::IngestDocument(document) => {
            if !state.stage_idle() {
                return None;
            }
            if let Document::Text(text) = document {
                state.source_text = text;
                return update(state, Msg::AnalyzeSymptoms);
            }
            if !state.has_credential() {
                return None;
            }
            if document.is_empty() {
                state.reject(CallFailure::Validation("Document is empty".to_string()));
                return None;
            }
            state.debug_log.push(
                LogSeverity::Info,
                format!("Uploading document: {}", document.describe()),
            );
            let prompt = prompts::ingest_document(&document);
            state.begin_stage(RequestKind::IngestDocument, prompt)
        }
        Msg::AnalyzeSymptoms => {
            if !state.stage_idle() || !state.has_credential() {
                return None;
            }
            if state.source_text.trim().is_empty() {
                state.reject(CallFailure::Validation(
                    "Paste or upload a medical document first".to_string(),
                ));
                return None;
            }
            let prompt = prompts::extract_symptoms(&state.source_text);
            state.begin_stage(RequestKind::ExtractSymptoms, prompt)
        }
        Msg::ToggleSymptom(name) => {
            let known = state.extracted.iter().flatten().any(|s| s.name == name);
            if !known {
                state
                    .debug_log
                    .push(LogSeverity::Warning, format!("Unknown symptom: {}", name));
            } else if !state.confirmed.remove(&name) {
                state.confirmed.insert(name);
            }
            None
        }
        Msg::SetAdditionalSymptoms(text) => {
            state.additional_symptoms = text;
            None
        }
        Msg::AnalyzeCauses => {
            if !state.stage_idle() || !state.has_credential() {
                return None;
            }
            let confirmed = state.confirmed_symptoms();
            if confirmed.is_empty() && state.additional_symptoms.trim().is_empty() {
                state.reject(CallFailure::Validation(
                    "Confirm at least one symptom or describe additional symptoms".to_string(),
                ));
                return None;
            }
            let prompt = prompts::analyze_causes(&confirmed, &state.additional_symptoms);
            state.begin_stage(RequestKind::AnalyzeCauses, prompt)
        }
        Msg::FindSolutions => {
            if !state.stage_idle() || !state.has_credential() {
                return None;
            }
            let prompt = match &state.causes {
                Some(causes) if !causes.is_empty() => prompts::find_solutions(causes),
                _ => {
                    state.reject(CallFailure::Validation(
                        "Run cause analysis before looking up solutions".to_string(),
                    ));
                    return None;
                }
            };
            state.begin_stage(RequestKind::FindSolutions, prompt)
        }
        Msg::OpenChat(topic) => {
            if state.treatment(topic).is_none() {
                state.notify(LogSeverity::Warning, "Unknown treatment");
                return None;
            }
            state.chats.entry(topic).or_insert_with(|| ChatSession {
                topic,
                messages: Vec::new(),
            });
            state.open_chat = Some(topic);
            None
        }
        Msg::SendChat { topic, text } => {
            if state.chat_pending.is_some() {
                state
                    .debug_log
                    .push(LogSeverity::Warning, "A chat reply is still pending");
                return None;
            }
            if !state.has_credential() {
                return None;
            }
            let text = text.trim().to_string();
            if text.is_empty() {
                state.reject(CallFailure::Validation("Message cannot be empty".to_string()));
                return None;
            }
            let treatment = match state.treatment(topic) {
                Some(t) => t.clone(),
                None => {
                    state.notify(LogSeverity::Warning, "Unknown treatment");
                    return None;
                }
            };
            let session = state.chats.entry(topic).or_insert_with(|| ChatSession {
                topic,
                messages: Vec::new(),
            });
            session.messages.push(Message::user(text));
            let prompt = prompts::chat(&treatment, &session.messages);
            state.open_chat = Some(topic);
            let command = state.issue(RequestKind::Chat(topic), prompt);
            if command.is_some() {
                state.chat_pending = Some(topic);
            }
            command
        }
        Msg::AskRecommended { topic, index } => {
            let question = state
                .treatment(topic)
                .and_then(|t| t.questions.get(index))
                .cloned();
            match question {
                Some(text) => update(state, Msg::SendChat { topic, text }),
                None => {
                    state.notify(LogSeverity::Warning, "Unknown recommended question");
                    None
                }
            }
        }
        Msg::ClearDebugLog => {
            state.debug_log.clear();
            None
        }
        Msg::DismissNotice => {
            state.notice = None;
            None
        }
        Msg::RelayCompleted { kind, outcome } => match outcome {
            Ok(reply) => {
                state.debug_log.push(
                    LogSeverity::Success,
                    format!(
                        "{} completed ({} tokens)",
                        kind.label(),
                        reply.usage.total()
                    ),
                );
                complete(state, kind, reply)
            }
            Err(failure) => {
                state.fail(kind, failure);
                None
            }
        },
    }
}

fn parse_failure(kind: RequestKind, reason: impl fmt::Display) -> CallFailure {
    CallFailure::Parse {
        stage: kind.label(),
        reason: reason.to_string(),
    }
}

/**
 * \brief 部分条目被跳过时在调试日志中留下警告。
 */
fn note_skipped(state: &mut WorkflowState, kind: RequestKind, skipped: &[String]) {
    for reason in skipped {
        state.debug_log.push(
            LogSeverity::Warning,
            format!("{}: skipped unrecognized entry ({})", kind.label(), reason),
        );
    }
}

fn complete(state: &mut WorkflowState, kind: RequestKind, reply: RelayReply) -> Option<Command> {
    match kind {
        RequestKind::IngestDocument => {
            if reply.text.trim().is_empty() {
                state.fail(kind, parse_failure(kind, "no text returned"));
                return None;
            }
            state.source_text = reply.text.clone();
            state.document_summary = Some(reply.text);
            let prompt = prompts::extract_symptoms(&state.source_text);
            let command = state.issue(RequestKind::ExtractSymptoms, prompt);
            if command.is_none() {
                state.busy = false;
            }
            command
        }
        RequestKind::ExtractSymptoms => {
            match extract::parse_symptoms(&reply.text) {
                Ok(parsed) => {
                    note_skipped(state, kind, &parsed.skipped);
                    let mut seen = BTreeSet::new();
                    let symptoms: Vec<Symptom> = parsed
                        .items
                        .into_iter()
                        .filter(|s| seen.insert(s.name.trim().to_lowercase()))
                        .collect();
                    if symptoms.is_empty() {
                        state.debug_log.push(
                            LogSeverity::Warning,
                            "No symptoms found; add them manually",
                        );
                    }
                    state
                        .confirmed
                        .retain(|name| symptoms.iter().any(|s| &s.name == name));
                    state.extracted = Some(symptoms);
                    state.stage = Stage::Symptoms;
                    state.busy = false;
                }
                Err(e) => state.fail(kind, parse_failure(kind, e)),
            }
            None
        }
        RequestKind::AnalyzeCauses => {
            match extract::parse_causes(&reply.text) {
                Ok(parsed) if parsed.items.is_empty() => {
                    state.fail(kind, parse_failure(kind, "no causes identified"));
                }
                Ok(parsed) => {
                    note_skipped(state, kind, &parsed.skipped);
                    state.causes = Some(parsed.items);
                    state.stage = Stage::Causes;
                    state.busy = false;
                }
                Err(e) => state.fail(kind, parse_failure(kind, e)),
            }
            None
        }
        RequestKind::FindSolutions => {
            match extract::parse_solutions(&reply.text) {
                Ok(parsed) => {
                    let mut categories = parsed.items;
                    let count: usize = categories.iter().map(|c| c.treatments.len()).sum();
                    if count == 0 {
                        state.fail(kind, parse_failure(kind, "no treatments returned"));
                        return None;
                    }
                    for treatment in categories.iter_mut().flat_map(|c| c.treatments.iter_mut()) {
                        treatment.id = TreatmentId(state.next_treatment_id);
                        state.next_treatment_id += 1;
                    }
                    note_skipped(state, kind, &parsed.skipped);
                    state.solutions = Some(categories);
                    state.stage = Stage::Solutions;
                    state.busy = false;
                }
                Err(e) => state.fail(kind, parse_failure(kind, e)),
            }
            None
        }
        RequestKind::Chat(topic) => {
            state
                .chats
                .entry(topic)
                .or_insert_with(|| ChatSession {
                    topic,
                    messages: Vec::new(),
                })
                .messages
                .push(Message::assistant(reply.text));
            state.chat_pending = None;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SymptomSeverity, Usage};

    fn ready_state() -> WorkflowState {
        WorkflowState::new(Some("sk-ant-test".to_string()))
    }

    fn reply(text: &str) -> Result<RelayReply, CallFailure> {
        Ok(RelayReply {
            text: text.to_string(),
            usage: Usage {
                input_tokens: 12,
                output_tokens: 30,
            },
        })
    }

    fn extracted_state(reply_text: &str) -> WorkflowState {
        let mut state = ready_state();
        update(&mut state, Msg::SetSourceText("report".to_string()));
        let command = update(&mut state, Msg::AnalyzeSymptoms).expect("command");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: reply(reply_text),
            },
        );
        state
    }

    const SYMPTOMS: &str = r#"[{"symptom":"Fatigue","severity":"mild","source":"tired"},{"symptom":"Pallor","severity":"moderate","source":"pale"}]"#;
    const CAUSES: &str = r#"{"causes":[{"condition":"Anemia","probability":"high","explanation":"Low Hb","urgency":"soon"}]}"#;
    const SOLUTIONS: &str = r#"{"solutions":[{"category":"Allopathic","treatments":[{"name":"Iron","description":"Ferrous sulfate","source":"NHS","sourceUrl":"https://nhs.uk/iron","questions":["How long?","Side effects?"]}]},{"category":"Ayurvedic","treatments":[{"name":"Iron","description":"Lauha bhasma","source":"AYUSH","sourceUrl":"https://ayush.gov.in","questions":[]}]}]}"#;

    fn solutions_state() -> WorkflowState {
        let mut state = extracted_state(SYMPTOMS);
        update(&mut state, Msg::ToggleSymptom("Fatigue".to_string()));
        let cmd = update(&mut state, Msg::AnalyzeCauses).expect("causes command");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: cmd.kind,
                outcome: reply(CAUSES),
            },
        );
        let cmd = update(&mut state, Msg::FindSolutions).expect("solutions command");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: cmd.kind,
                outcome: reply(SOLUTIONS),
            },
        );
        state
    }

    #[test]
    fn test_hemoglobin_scenario_extracts_one_symptom() {
        let mut state = ready_state();
        update(
            &mut state,
            Msg::SetSourceText("Hemoglobin: 8.2 g/dL (low)".to_string()),
        );
        let command = update(&mut state, Msg::AnalyzeSymptoms).expect("command");
        assert_eq!(command.kind, RequestKind::ExtractSymptoms);
        assert!(state.busy);
        assert_eq!(command.request.api_key, "sk-ant-test");
        assert!(command.request.messages[0]
            .text()
            .contains("Hemoglobin: 8.2 g/dL (low)"));

        let next = update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: reply(
                    r#"[{"symptom":"Low hemoglobin","severity":"moderate","source":"Hemoglobin: 8.2 g/dL"}]"#,
                ),
            },
        );
        assert!(next.is_none());
        assert!(!state.busy);
        assert_eq!(state.stage, Stage::Symptoms);
        let extracted = state.extracted.as_ref().expect("extracted");
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].name, "Low hemoglobin");
        assert_eq!(extracted[0].severity, SymptomSeverity::Moderate);
        assert_eq!(extracted[0].source, "Hemoglobin: 8.2 g/dL");
    }

    #[test]
    fn test_extraction_dedups_by_name() {
        let state = extracted_state(
            r#"[{"symptom":"Fatigue","severity":"mild","source":"a"},{"symptom":"fatigue ","severity":"severe","source":"b"}]"#,
        );
        let extracted = state.extracted.expect("extracted");
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].source, "a");
    }

    #[test]
    fn test_odd_severity_keeps_the_rest_of_the_extraction() {
        let state = extracted_state(
            r#"[{"symptom":"Fatigue","severity":"MiLd","source":"a"},{"symptom":"Dyspnea","severity":"moderate-severe","source":"b"}]"#,
        );
        assert_eq!(state.stage, Stage::Symptoms);
        let extracted = state.extracted.as_ref().expect("extracted");
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].severity, SymptomSeverity::Mild);
        assert!(state.debug_log.entries().iter().any(|e| {
            e.severity == LogSeverity::Warning && e.message.contains("moderate-severe")
        }));
    }

    #[test]
    fn test_toggle_twice_unconfirms() {
        let mut state = extracted_state(SYMPTOMS);
        update(&mut state, Msg::ToggleSymptom("Fatigue".to_string()));
        assert!(state.is_confirmed("Fatigue"));
        update(&mut state, Msg::ToggleSymptom("Fatigue".to_string()));
        assert!(!state.is_confirmed("Fatigue"));
        update(&mut state, Msg::ToggleSymptom("Unknown".to_string()));
        assert!(state.confirmed.is_empty());
    }

    #[test]
    fn test_cause_analysis_refused_without_input() {
        let mut state = extracted_state(SYMPTOMS);
        let command = update(&mut state, Msg::AnalyzeCauses);
        assert!(command.is_none());
        assert!(!state.busy);
        assert_eq!(state.stage, Stage::Symptoms);
        assert_eq!(
            state.notice.as_ref().map(|n| n.severity),
            Some(LogSeverity::Error)
        );

        update(
            &mut state,
            Msg::SetAdditionalSymptoms("   ".to_string()),
        );
        assert!(update(&mut state, Msg::AnalyzeCauses).is_none());
    }

    #[test]
    fn test_additional_text_alone_allows_cause_analysis() {
        let mut state = extracted_state(SYMPTOMS);
        update(
            &mut state,
            Msg::SetAdditionalSymptoms("shortness of breath".to_string()),
        );
        let command = update(&mut state, Msg::AnalyzeCauses).expect("command");
        assert_eq!(command.kind, RequestKind::AnalyzeCauses);
        assert!(command.request.messages[0]
            .text()
            .contains("shortness of breath"));
    }

    #[test]
    fn test_cause_reply_without_object_keeps_stage() {
        let mut state = extracted_state(SYMPTOMS);
        update(&mut state, Msg::ToggleSymptom("Pallor".to_string()));
        let command = update(&mut state, Msg::AnalyzeCauses).expect("command");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: reply("I cannot determine causes from this."),
            },
        );
        assert!(state.causes.is_none());
        assert!(!state.busy);
        assert_eq!(state.stage, Stage::Symptoms);
        let notice = state.notice.expect("notice");
        assert_eq!(notice.severity, LogSeverity::Error);
        assert!(notice.text.contains("Cause analysis"));
        let last = state.debug_log.entries().last().expect("log entry");
        assert_eq!(last.severity, LogSeverity::Error);
    }

    #[test]
    fn test_missing_credential_blocks_call() {
        let mut state = WorkflowState::new(None);
        update(&mut state, Msg::SetSourceText("text".to_string()));
        assert!(update(&mut state, Msg::AnalyzeSymptoms).is_none());
        assert!(!state.busy);
        let notice = state.notice.expect("notice");
        assert_eq!(notice.text, CallFailure::MissingCredential.to_string());
    }

    #[test]
    fn test_empty_source_text_is_rejected() {
        let mut state = ready_state();
        update(&mut state, Msg::SetSourceText(" \n ".to_string()));
        assert!(update(&mut state, Msg::AnalyzeSymptoms).is_none());
        assert_eq!(state.stage, Stage::Upload);
    }

    #[test]
    fn test_busy_blocks_second_stage_call() {
        let mut state = ready_state();
        update(&mut state, Msg::SetSourceText("text".to_string()));
        assert!(update(&mut state, Msg::AnalyzeSymptoms).is_some());
        assert!(update(&mut state, Msg::AnalyzeSymptoms).is_none());
    }

    #[test]
    fn test_failure_clears_busy_and_keeps_prior_state() {
        let mut state = extracted_state(SYMPTOMS);
        let before = state.extracted.clone();
        update(&mut state, Msg::ToggleSymptom("Fatigue".to_string()));
        let command = update(&mut state, Msg::AnalyzeCauses).expect("command");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: Err(CallFailure::Upstream {
                    status: 401,
                    message: "invalid x-api-key".to_string(),
                }),
            },
        );
        assert!(!state.busy);
        assert_eq!(state.extracted, before);
        assert!(state.is_confirmed("Fatigue"));
        assert!(state
            .notice
            .expect("notice")
            .text
            .contains("invalid x-api-key"));
    }

    #[test]
    fn test_document_ingestion_chains_symptom_extraction() {
        let mut state = ready_state();
        let command = update(
            &mut state,
            Msg::IngestDocument(Document::Pdf(b"%PDF-1.4".to_vec())),
        )
        .expect("ingest command");
        assert_eq!(command.kind, RequestKind::IngestDocument);
        let next = update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: reply("Hemoglobin 8.2 g/dL, flagged low"),
            },
        )
        .expect("chained command");
        assert_eq!(next.kind, RequestKind::ExtractSymptoms);
        assert!(state.busy);
        assert_eq!(state.source_text, "Hemoglobin 8.2 g/dL, flagged low");
    }

    #[test]
    fn test_text_document_skips_ingestion() {
        let mut state = ready_state();
        let command = update(
            &mut state,
            Msg::IngestDocument(Document::Text("Platelets 90k".to_string())),
        )
        .expect("command");
        assert_eq!(command.kind, RequestKind::ExtractSymptoms);
    }

    #[test]
    fn test_full_flow_assigns_unique_treatment_ids() {
        let state = solutions_state();
        assert_eq!(state.stage, Stage::Solutions);
        let solutions = state.solutions.as_ref().expect("solutions");
        let ids: Vec<TreatmentId> = solutions
            .iter()
            .flat_map(|c| c.treatments.iter().map(|t| t.id))
            .collect();
        assert_eq!(ids, vec![TreatmentId(1), TreatmentId(2)]);
        assert_eq!(state.treatment(TreatmentId(2)).map(|t| t.description.as_str()), Some("Lauha bhasma"));
    }

    #[test]
    fn test_revisit_keeps_downstream_state() {
        let mut state = solutions_state();
        update(&mut state, Msg::GoToStage(Stage::Symptoms));
        assert_eq!(state.stage, Stage::Symptoms);
        assert!(state.causes.is_some());
        assert!(state.solutions.is_some());
        update(&mut state, Msg::GoToStage(Stage::Solutions));
        assert_eq!(state.stage, Stage::Solutions);
    }

    #[test]
    fn test_cannot_jump_to_unavailable_stage() {
        let mut state = ready_state();
        update(&mut state, Msg::GoToStage(Stage::Causes));
        assert_eq!(state.stage, Stage::Upload);
    }

    #[test]
    fn test_views_do_not_touch_workflow() {
        let mut state = extracted_state(SYMPTOMS);
        update(&mut state, Msg::ShowView(View::Debug));
        assert_eq!(state.view, View::Debug);
        assert_eq!(state.stage, Stage::Symptoms);
        update(&mut state, Msg::ShowView(View::Settings));
        assert!(state.extracted.is_some());
    }

    #[test]
    fn test_chat_sessions_are_separate_per_treatment() {
        let mut state = solutions_state();
        update(&mut state, Msg::OpenChat(TreatmentId(1)));
        assert!(state.chat(TreatmentId(1)).expect("session").messages.is_empty());

        let command = update(
            &mut state,
            Msg::SendChat {
                topic: TreatmentId(1),
                text: "Can I take it with tea?".to_string(),
            },
        )
        .expect("chat command");
        assert_eq!(command.kind, RequestKind::Chat(TreatmentId(1)));
        assert!(command
            .request
            .system
            .as_deref()
            .unwrap_or_default()
            .contains("https://nhs.uk/iron"));

        let again = update(
            &mut state,
            Msg::SendChat {
                topic: TreatmentId(2),
                text: "Is it safe?".to_string(),
            },
        );
        assert!(again.is_none());

        update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: reply("Avoid tea within an hour."),
            },
        );
        let session = state.chat(TreatmentId(1)).expect("session");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert!(state.chat(TreatmentId(2)).is_none());
        assert!(state.chat_pending.is_none());
    }

    #[test]
    fn test_chat_is_independent_of_stage_busy() {
        let mut state = solutions_state();
        state.busy = true;
        let command = update(
            &mut state,
            Msg::AskRecommended {
                topic: TreatmentId(1),
                index: 1,
            },
        )
        .expect("chat command");
        assert_eq!(command.request.messages[0].text(), "Side effects?");
    }

    #[test]
    fn test_chat_failure_rolls_back_user_turn() {
        let mut state = solutions_state();
        let command = update(
            &mut state,
            Msg::SendChat {
                topic: TreatmentId(1),
                text: "Dose?".to_string(),
            },
        )
        .expect("command");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: command.kind,
                outcome: Err(CallFailure::Transport("connection refused".to_string())),
            },
        );
        assert!(state.chat(TreatmentId(1)).expect("session").messages.is_empty());
        assert!(state.chat_pending.is_none());
    }

    #[test]
    fn test_empty_solutions_are_a_failure() {
        let mut state = extracted_state(SYMPTOMS);
        update(&mut state, Msg::ToggleSymptom("Fatigue".to_string()));
        let cmd = update(&mut state, Msg::AnalyzeCauses).expect("causes");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: cmd.kind,
                outcome: reply(CAUSES),
            },
        );
        let cmd = update(&mut state, Msg::FindSolutions).expect("solutions");
        update(
            &mut state,
            Msg::RelayCompleted {
                kind: cmd.kind,
                outcome: reply(r#"{"solutions": []}"#),
            },
        );
        assert_eq!(state.stage, Stage::Causes);
        assert!(state.solutions.is_none());
    }

    #[test]
    fn test_debug_log_brackets_each_call() {
        let mut state = extracted_state(SYMPTOMS);
        let messages: Vec<&str> = state
            .debug_log
            .entries()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(
            messages,
            vec![
                "Symptom extraction request sent (1 message(s))",
                "Symptom extraction completed (42 tokens)"
            ]
        );
        update(&mut state, Msg::ClearDebugLog);
        assert!(state.debug_log.entries().is_empty());
        assert_eq!(state.stage, Stage::Symptoms);
    }
}
