use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use medlens_core_sdk::controller::Controller;
use medlens_core_sdk::db::Connection;
use medlens_core_sdk::document::Document;
use medlens_core_sdk::llm::HttpRelay;
use medlens_core_sdk::models::TreatmentId;
use medlens_core_sdk::server::RelayConfig;
use medlens_core_sdk::workflow::{LogSeverity, Msg, Stage, View, WorkflowState};
use medlens_core_sdk::{db, server, telemetry};

/**
 * \brief CLI 程序入口：中继服务与交互式报告分析。
 */
#[derive(Parser, Debug)]
#[command(name = "medlens", version, about = "MedLens medical report assistant")]
struct Cli {
    /** \brief 本次运行开启遥测日志，不改变已保存的设置 */
    #[arg(long, global = true)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动中继服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3001")]
        addr: String,
        /** \brief 前端目录，默认读取 MEDLENS_UI_DIR */
        #[arg(long)]
        ui_dir: Option<PathBuf>,
        /** \brief 上游 API 基地址 */
        #[arg(long)]
        upstream: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /**
     * \brief 管理本地保存的 API 凭据。
     */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 开关本地遥测日志（logs/medlens.log）。
     */
    Telemetry { state: Toggle },

    /**
     * \brief 交互式分析：症状提取、病因分析、治疗方案与追问。
     */
    Analyze {
        /** \brief 报告文件：PDF、图片或文本 */
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /** \brief 直接粘贴的报告文本 */
        #[arg(long)]
        text: Option<String>,
        #[arg(long, default_value = "http://127.0.0.1:3001")]
        relay: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Set { key: String },
    Show,
    Clear,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open settings database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(cli.telemetry || telemetry_enabled);

    match cli.command {
        Commands::Serve {
            addr,
            ui_dir,
            upstream,
            timeout_secs,
        } => {
            let mut config = RelayConfig::from_env();
            if let Some(dir) = ui_dir {
                config.ui_dir = dir;
            }
            if let Some(base) = upstream {
                config.upstream_base = base;
            }
            if let Some(secs) = timeout_secs {
                config.upstream_timeout = Duration::from_secs(secs);
            }
            server::run(&addr, config).await?;
        }
        Commands::Key { action } => match action {
            KeyAction::Set { key } => {
                if key.trim().is_empty() {
                    bail!("API key cannot be empty");
                }
                db::save_credential(&conn, &key).context("save API key failed")?;
                println!("API key saved ({})", db::mask_credential(key.trim()));
            }
            KeyAction::Show => match db::load_credential(&conn)? {
                Some(key) => println!("{}", db::mask_credential(&key)),
                None => println!("No API key stored"),
            },
            KeyAction::Clear => {
                db::clear_credential(&conn).context("clear API key failed")?;
                println!("API key cleared");
            }
        },
        Commands::Telemetry { state } => {
            let enabled = matches!(state, Toggle::On);
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Analyze {
            file,
            text,
            relay,
            model,
            max_tokens,
            timeout_secs,
        } => {
            let mut state = WorkflowState::new(db::load_credential(&conn)?);
            state.model = model;
            state.max_tokens = max_tokens;
            let transport = HttpRelay::new(&relay);
            telemetry::log_event("cli.analyze", &format!("relay={}", transport.endpoint()));
            let controller =
                Controller::new(state, transport).with_timeout(Duration::from_secs(timeout_secs));
            run_session(controller, &conn, file, text).await?;
        }
    }

    Ok(())
}

type Input = Lines<BufReader<Stdin>>;

async fn prompt_line(input: &mut Input, label: &str) -> Result<Option<String>> {
    use std::io::Write;
    print!("{}", label);
    std::io::stdout().flush().ok();
    Ok(input.next_line().await?)
}

async fn run_session(
    mut controller: Controller<HttpRelay>,
    conn: &Connection,
    file: Option<PathBuf>,
    text: Option<String>,
) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let handle = controller.cancel_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if handle.cancel() {
                eprintln!("\nRequest cancelled");
            } else {
                std::process::exit(130);
            }
        }
    });

    while controller.state().credential.is_none() {
        controller.dispatch(Msg::ShowView(View::Settings)).await;
        let Some(key) = prompt_line(&mut input, "Enter your API key: ").await? else {
            return Ok(());
        };
        controller.dispatch(Msg::SetCredential(key.clone())).await;
        if controller.state().credential.is_some() {
            db::save_credential(conn, &key).context("save API key failed")?;
        }
        show_notice(controller.state());
    }
    controller.dispatch(Msg::ShowView(View::Workflow)).await;

    match (file, text) {
        (Some(path), _) => match Document::from_path(&path) {
            Ok(document) => {
                println!("Analyzing {} ...", document.describe());
                controller.dispatch(Msg::IngestDocument(document)).await;
            }
            Err(e) => bail!("{}: {}", path.display(), e),
        },
        (None, Some(text)) => {
            controller.dispatch(Msg::SetSourceText(text)).await;
            controller.dispatch(Msg::AnalyzeSymptoms).await;
        }
        (None, None) => {
            println!("Paste the report text, then an empty line:");
            let mut pasted = Vec::new();
            while let Some(line) = input.next_line().await? {
                if line.trim().is_empty() {
                    break;
                }
                pasted.push(line);
            }
            controller.dispatch(Msg::SetSourceText(pasted.join("\n"))).await;
            controller.dispatch(Msg::AnalyzeSymptoms).await;
        }
    }
    render(controller.state());
    print_help();

    loop {
        let Some(line) = prompt_line(&mut input, "> ").await? else {
            break;
        };
        let line = line.trim();
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();
        let msg = match cmd {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            "toggle" => match nth_symptom(controller.state(), arg) {
                Some(name) => Msg::ToggleSymptom(name),
                None => {
                    println!("Usage: toggle <symptom number>");
                    continue;
                }
            },
            "extra" => Msg::SetAdditionalSymptoms(arg.to_string()),
            "retry" => Msg::AnalyzeSymptoms,
            "causes" => Msg::AnalyzeCauses,
            "solutions" => Msg::FindSolutions,
            "stage" => match parse_stage(arg) {
                Some(stage) => Msg::GoToStage(stage),
                None => {
                    println!("Usage: stage upload|symptoms|causes|solutions");
                    continue;
                }
            },
            "open" => match nth_treatment(controller.state(), arg) {
                Some(id) => Msg::OpenChat(id),
                None => {
                    println!("Usage: open <treatment number>");
                    continue;
                }
            },
            "ask" => match (controller.state().open_chat, arg.parse::<usize>()) {
                (Some(topic), Ok(n)) if n > 0 => Msg::AskRecommended {
                    topic,
                    index: n - 1,
                },
                _ => {
                    println!("Open a treatment first, then: ask <question number>");
                    continue;
                }
            },
            "say" => match controller.state().open_chat {
                Some(topic) => Msg::SendChat {
                    topic,
                    text: arg.to_string(),
                },
                None => {
                    println!("Open a treatment first: open <treatment number>");
                    continue;
                }
            },
            "log" => Msg::ShowView(View::Debug),
            "clear-log" => Msg::ClearDebugLog,
            "key" => Msg::SetCredential(arg.to_string()),
            other => {
                println!("Unknown command: {} (type `help`)", other);
                continue;
            }
        };
        let saving_key = matches!(msg, Msg::SetCredential(_));
        controller.dispatch(msg).await;
        if saving_key && controller.state().credential.is_some() {
            db::save_credential(conn, arg).context("save API key failed")?;
        }
        render(controller.state());
        if controller.state().view == View::Debug {
            controller.dispatch(Msg::ShowView(View::Workflow)).await;
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        "Commands: toggle <n> | extra <text> | retry | causes | solutions | stage <name> |\n          \
         open <n> | ask <n> | say <text> | log | clear-log | key <api key> | quit"
    );
}

fn parse_stage(arg: &str) -> Option<Stage> {
    match arg {
        "upload" => Some(Stage::Upload),
        "symptoms" => Some(Stage::Symptoms),
        "causes" => Some(Stage::Causes),
        "solutions" => Some(Stage::Solutions),
        _ => None,
    }
}

fn nth_symptom(state: &WorkflowState, arg: &str) -> Option<String> {
    let n = arg.parse::<usize>().ok()?.checked_sub(1)?;
    state.extracted.as_ref()?.get(n).map(|s| s.name.clone())
}

fn nth_treatment(state: &WorkflowState, arg: &str) -> Option<TreatmentId> {
    let n = arg.parse::<usize>().ok()?.checked_sub(1)?;
    state
        .solutions
        .as_ref()?
        .iter()
        .flat_map(|c| c.treatments.iter())
        .nth(n)
        .map(|t| t.id)
}

fn show_notice(state: &WorkflowState) {
    if let Some(notice) = &state.notice {
        let marker = match notice.severity {
            LogSeverity::Error => "!!",
            LogSeverity::Warning => "! ",
            LogSeverity::Success => "ok",
            LogSeverity::Info => "--",
        };
        println!("[{}] {}", marker, notice.text);
    }
}

/**
 * \brief 按当前视图与阶段输出状态。
 */
fn render(state: &WorkflowState) {
    show_notice(state);
    match state.view {
        View::Debug => {
            println!("-- debug log ({} entries) --", state.debug_log.entries().len());
            for entry in state.debug_log.entries() {
                println!("{}", entry);
            }
            return;
        }
        View::Settings => {
            let key = state
                .credential
                .as_deref()
                .map(db::mask_credential)
                .unwrap_or_else(|| "(not set)".to_string());
            println!("-- settings --\nAPI key: {}", key);
            return;
        }
        View::Workflow => {}
    }

    match state.stage {
        Stage::Upload => {
            println!("-- upload --");
            if let Some(summary) = &state.document_summary {
                println!("{}", summary);
            }
        }
        Stage::Symptoms => {
            println!("-- symptoms (toggle to confirm) --");
            for (i, s) in state.extracted.iter().flatten().enumerate() {
                let mark = if state.is_confirmed(&s.name) { "x" } else { " " };
                println!(
                    "{:>2}. [{}] {} ({:?}) - {}",
                    i + 1,
                    mark,
                    s.name,
                    s.severity,
                    s.source
                );
            }
            if !state.additional_symptoms.trim().is_empty() {
                println!("Additional: {}", state.additional_symptoms);
            }
        }
        Stage::Causes => {
            println!("-- possible causes --");
            for c in state.causes.iter().flatten() {
                println!(
                    "* {} [probability: {:?}, urgency: {:?}]\n  {}",
                    c.condition, c.probability, c.urgency, c.explanation
                );
            }
        }
        Stage::Solutions => {
            println!("-- treatment options --");
            let mut n = 0;
            for category in state.solutions.iter().flatten() {
                println!("{}", category.category);
                for t in &category.treatments {
                    n += 1;
                    println!("{:>2}. {} - {}", n, t.name, t.description);
                    println!("    source: {} <{}>", t.source, t.source_url);
                }
            }
            if let Some(topic) = state.open_chat {
                render_chat(state, topic);
            }
        }
    }
}

fn render_chat(state: &WorkflowState, topic: TreatmentId) {
    let Some(treatment) = state.treatment(topic) else {
        return;
    };
    println!("-- chat: {} --", treatment.name);
    for (i, q) in treatment.questions.iter().enumerate() {
        println!("  ask {}: {}", i + 1, q);
    }
    if let Some(session) = state.chat(topic) {
        for m in &session.messages {
            println!("{:?}: {}", m.role, m.text());
        }
    }
    if state.chat_pending == Some(topic) {
        println!("(waiting for reply)");
    }
}
