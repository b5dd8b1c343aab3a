use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentstream_lib::connection::{ConnectionManager, ConnectionStatus};
use agentstream_lib::db::Database;
use agentstream_lib::events::{EventPayload, StreamEvent};
use agentstream_lib::store::{
    MessageRole, SessionPersistence, SqliteStateStorage, StoreHandle, UiPreferences,
};
use agentstream_lib::{init_tracing, load_stream_config, AppError, StreamConfig, StreamRequest};
use tokio::sync::watch;

const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Default)]
struct Options {
    prompt: Option<String>,
    base_url: Option<String>,
    session_id: Option<String>,
    model: Option<String>,
    file_ids: Vec<String>,
    db_path: Option<PathBuf>,
    timeout: Option<Duration>,
    max_reconnects: Option<u32>,
    help: bool,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut options = Options::default();
        while let Some(flag) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .ok_or_else(|| format!("missing value for {name}"))
            };
            match flag.as_str() {
                "--prompt" | "-p" => options.prompt = Some(value("--prompt")?),
                "--url" => options.base_url = Some(value("--url")?),
                "--session" => options.session_id = Some(value("--session")?),
                "--model" => options.model = Some(value("--model")?),
                "--file" => options.file_ids.push(value("--file")?),
                "--db" => options.db_path = Some(PathBuf::from(value("--db")?)),
                "--timeout-secs" => {
                    let raw = value("--timeout-secs")?;
                    let secs = raw
                        .parse::<u64>()
                        .map_err(|_| format!("invalid --timeout-secs value '{raw}'"))?;
                    options.timeout = Some(Duration::from_secs(secs));
                }
                "--max-reconnects" => {
                    let raw = value("--max-reconnects")?;
                    options.max_reconnects = Some(
                        raw.parse::<u32>()
                            .map_err(|_| format!("invalid --max-reconnects value '{raw}'"))?,
                    );
                }
                "--help" | "-h" => options.help = true,
                other => return Err(format!("unknown argument '{other}' (try --help)")),
            }
        }
        Ok(options)
    }
}

fn print_usage() {
    println!(
        "stream_tail: follow an agent event stream and print what arrives\n\n\
         usage: stream_tail --prompt <text> [options]\n\n\
         options:\n  \
           --url <base>            stream endpoint (default from settings or AGENTSTREAM_BASE_URL)\n  \
           --session <id>          continue an existing agent session\n  \
           --model <name>          model to request\n  \
           --file <uuid>           attach an uploaded file (repeatable)\n  \
           --db <path>             SQLite file for settings and session snapshots\n  \
           --timeout-secs <n>      give up after n seconds\n  \
           --max-reconnects <n>    reconnect budget before failing"
    );
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(error) = run().await {
        eprintln!("stream_tail failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let options = Options::parse(std::env::args().skip(1)).map_err(AppError::Other)?;
    if options.help {
        print_usage();
        return Ok(());
    }
    let prompt = options
        .prompt
        .clone()
        .ok_or_else(|| AppError::Other("--prompt is required (try --help)".to_string()))?;

    let db = match &options.db_path {
        Some(path) => Some(Arc::new(Database::open(path)?)),
        None => None,
    };
    let mut config = match &db {
        Some(db) => load_stream_config(db)?,
        None => {
            let mut config = StreamConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(url) = options.base_url.clone() {
        config.base_url = url;
    }
    if let Some(attempts) = options.max_reconnects {
        config.max_reconnect_attempts = attempts;
    }
    config.validate()?;

    let store = StoreHandle::with_capacity(config.capacity);
    let persistence = db.as_ref().map(|db| {
        SessionPersistence::new(SqliteStateStorage::new(Arc::clone(db)), config.persistence)
    });
    let preferences = match &persistence {
        Some(persistence) => {
            let restored = persistence.load();
            let preferences = restored.preferences.clone();
            restored.restore_into(&mut store.write());
            preferences
        }
        None => UiPreferences::default(),
    };

    let session_id = options
        .session_id
        .clone()
        .or_else(|| store.read().current_session_id().map(ToString::to_string));
    let mut request = StreamRequest::new(prompt).with_file_ids(options.file_ids.clone());
    request.session_id = session_id;
    request.model = options.model.clone();
    let request = request.with_prompt_file_references();

    {
        let mut guard = store.write();
        guard.set_current_session_id(request.session_id.clone());
        guard.append_user_message(request.prompt.clone());
        guard.begin_assistant_message();
    }

    let manager = ConnectionManager::with_sse(config, store.clone())?;
    manager.on_any(|event| {
        println!("[{}] {}", event.kind(), summarize(event));
        Ok(())
    });
    manager.on_state_change(|state| {
        match &state.error_message {
            Some(message) => eprintln!("-- {} ({message})", state.status),
            None => eprintln!("-- {}", state.status),
        }
        Ok(())
    });

    let mut states = manager.watch_state();
    manager.start(&request)?;

    let deadline = async {
        match options.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = wait_until_finished(&mut states) => {}
        _ = tokio::signal::ctrl_c() => eprintln!("-- interrupted"),
        _ = deadline => eprintln!("-- timed out"),
    }
    let final_state = manager.connection_state();
    manager.stop();

    print_summary(&store);
    if let Some(persistence) = &persistence {
        persistence.save(&store.read(), &preferences)?;
    }

    if final_state.status == ConnectionStatus::Error {
        return Err(AppError::Other(
            final_state
                .error_message
                .unwrap_or_else(|| "stream failed".to_string()),
        ));
    }
    Ok(())
}

async fn wait_until_finished(states: &mut watch::Receiver<agentstream_lib::ConnectionState>) {
    while states.changed().await.is_ok() {
        let status = states.borrow_and_update().status;
        if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error) {
            return;
        }
    }
}

fn summarize(event: &StreamEvent) -> String {
    match event.payload() {
        EventPayload::Planning(plan) => format!("{} steps", plan.steps.len()),
        EventPayload::ToolCall(call) => call.tool_name.clone(),
        EventPayload::ToolOutput(output) => preview(&output.output),
        EventPayload::CodeExecution(exec) => match exec.exit_code {
            Some(code) => format!("{} (exit {code})", exec.language),
            None => exec.language.clone(),
        },
        EventPayload::Observation(observation) => preview(&observation.content),
        EventPayload::Visualization(viz) => viz.title.clone().unwrap_or_default(),
        EventPayload::TodosUpdated(update) => format!("{} todos", update.todos.len()),
        EventPayload::FinalResult(result) => preview(&result.content),
        EventPayload::Error(err) if err.recoverable => format!("{} (recoverable)", err.error),
        EventPayload::Error(err) => err.error.clone(),
        EventPayload::Complete(done) => done.message.clone().unwrap_or_default(),
        EventPayload::Heartbeat => String::new(),
        EventPayload::Debug(debug) => preview(&debug.message),
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn print_summary(store: &StoreHandle) {
    let store = store.read();
    println!();
    println!(
        "messages: {}  events: {}  todos: {}  uploads: {}",
        store.messages().len(),
        store.events().len(),
        store.todos().len(),
        store.uploaded_files().len()
    );
    let answer = store
        .messages()
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::Assistant && !message.content.is_empty());
    if let Some(answer) = answer {
        println!("answer: {}", preview(&answer.content));
    }
}
