// packages/engine/src/commands.rs
//! Chat command adapter
//!
//! Turns operator text such as `/deploy echo https://... 123:ABC` into
//! engine calls and renders the outcome as a [`Reply`]. Nothing here holds
//! state: access control comes from `admin_ids`, everything else from the
//! engine.

use crate::lifecycle::Engine;
use crate::utils::errors::EngineError;
use crate::workload::{DeployRequest, OwnerId, Stats, Summary, WorkloadRecord, WorkloadStatus};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

const DEFAULT_LOG_LINES: usize = 20;

const HELP: &str = "\
Commands:
/deploy <name> <repo_url> <token> [entry] - fetch and build a bot
/start <name> - start a bot
/stop <name> - stop a bot
/restart <name> - restart a bot
/update <name> - pull, rebuild, keep running state
/remove <name> - delete a bot and its files
/logs <name> [lines] - recent output
/status [name] - state of one or all bots
/bots - list bots with totals
/stopall - stop every running bot
/removeall - remove every bot
/help - this text";

/// A parsed operator command
#[derive(Debug, Clone)]
pub enum Command {
    Deploy(DeployRequest),
    Start(String),
    Stop(String),
    Restart(String),
    Update(String),
    Remove(String),
    Logs { name: String, lines: usize },
    Status(Option<String>),
    Bots,
    StopAll,
    RemoveAll,
    Help,
}

impl Command {
    /// Parse command text. Errors are usage messages for the operator.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut words = text.split_whitespace();
        let head = words.next().ok_or_else(|| "empty command, try /help".to_string())?;
        let args: Vec<&str> = words.collect();

        let verb = head
            .strip_prefix('/')
            .ok_or_else(|| format!("'{}' is not a command, try /help", head))?;
        // "/start@SomeBot" addresses a specific bot in group chats
        let verb = verb.split('@').next().unwrap_or(verb).to_ascii_lowercase();

        let single = |usage: &str| -> Result<String, String> {
            match args.as_slice() {
                [name] => Ok(name.to_string()),
                _ => Err(format!("usage: {}", usage)),
            }
        };

        match verb.as_str() {
            "deploy" => match args.as_slice() {
                [name, url, token] | [name, url, token, _] => {
                    if !url.starts_with("http") {
                        return Err(format!(
                            "'{}' is not a repository URL, expected http(s)://...",
                            url
                        ));
                    }
                    let mut request = DeployRequest::new(*name, *url, *token);
                    if let [_, _, _, entry] = args.as_slice() {
                        request = request.with_entry_point(*entry);
                    }
                    Ok(Command::Deploy(request))
                }
                _ => Err("usage: /deploy <name> <repo_url> <token> [entry]".into()),
            },
            "start" => single("/start <name>").map(Command::Start),
            "stop" => single("/stop <name>").map(Command::Stop),
            "restart" => single("/restart <name>").map(Command::Restart),
            "update" => single("/update <name>").map(Command::Update),
            "remove" | "rm" => single("/remove <name>").map(Command::Remove),
            "logs" => match args.as_slice() {
                [name] => Ok(Command::Logs {
                    name: name.to_string(),
                    lines: DEFAULT_LOG_LINES,
                }),
                [name, lines] => {
                    let lines = lines
                        .parse::<usize>()
                        .map_err(|_| format!("'{}' is not a line count", lines))?;
                    Ok(Command::Logs {
                        name: name.to_string(),
                        lines,
                    })
                }
                _ => Err("usage: /logs <name> [lines]".into()),
            },
            "status" => match args.as_slice() {
                [] => Ok(Command::Status(None)),
                [name] => Ok(Command::Status(Some(name.to_string()))),
                _ => Err("usage: /status [name]".into()),
            },
            "bots" | "list" => Ok(Command::Bots),
            "stopall" => Ok(Command::StopAll),
            "removeall" => Ok(Command::RemoveAll),
            "help" => Ok(Command::Help),
            other => Err(format!("unknown command '/{}', try /help", other)),
        }
    }

    /// Label used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Deploy(_) => "deploy",
            Command::Start(_) => "start",
            Command::Stop(_) => "stop",
            Command::Restart(_) => "restart",
            Command::Update(_) => "update",
            Command::Remove(_) => "remove",
            Command::Logs { .. } => "logs",
            Command::Status(_) => "status",
            Command::Bots => "bots",
            Command::StopAll => "stopall",
            Command::RemoveAll => "removeall",
            Command::Help => "help",
        }
    }
}

/// Outcome shown to the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub success: bool,
    pub message: String,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Dispatches operator commands to the engine
pub struct CommandHandler {
    engine: Arc<Engine>,
    admins: HashSet<OwnerId>,
}

impl CommandHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let admins = engine.config().admin_ids.iter().copied().collect();
        Self { engine, admins }
    }

    /// Empty allow-list means open access
    pub fn is_authorized(&self, principal: OwnerId) -> bool {
        self.admins.is_empty() || self.admins.contains(&principal)
    }

    /// Authorize, parse and run one command
    pub async fn handle(&self, principal: OwnerId, text: &str) -> Reply {
        if !self.is_authorized(principal) {
            return Reply::fail("Access denied. Admin only.");
        }
        match Command::parse(text) {
            Ok(command) => self.execute(principal, command).await,
            Err(usage) => Reply::fail(usage),
        }
    }

    pub async fn execute(&self, owner: OwnerId, command: Command) -> Reply {
        let engine = &self.engine;
        match command {
            Command::Deploy(request) => {
                let name = request.name.clone();
                match engine.deploy(owner, request).await {
                    Ok(summary) => Reply::ok(format!(
                        "Bot '{}' deployed: {}. Use /start {} to run it.",
                        name, summary.message, name
                    )),
                    Err(e) => failure(&name, "deploy", &e),
                }
            }
            Command::Start(name) => lifecycle_reply(&name, "start", engine.start(owner, &name).await),
            Command::Stop(name) => lifecycle_reply(&name, "stop", engine.stop(owner, &name).await),
            Command::Restart(name) => {
                lifecycle_reply(&name, "restart", engine.restart(owner, &name).await)
            }
            Command::Update(name) => {
                lifecycle_reply(&name, "update", engine.update(owner, &name).await)
            }
            Command::Remove(name) => {
                lifecycle_reply(&name, "remove", engine.remove(owner, &name).await)
            }
            Command::Logs { name, lines } => match engine.logs(owner, &name, lines).await {
                Ok(lines) if lines.is_empty() => Reply::ok(format!("No logs for '{}' yet.", name)),
                Ok(lines) => Reply::ok(format!("Logs: {}\n{}", name, lines.join("\n"))),
                Err(e) => failure(&name, "read logs of", &e),
            },
            Command::Status(name) => match engine.status(owner, name.as_deref()).await {
                Ok(records) if records.is_empty() => Reply::ok("No bots deployed yet."),
                Ok(records) => Reply::ok(
                    records
                        .iter()
                        .map(render_detail)
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                ),
                Err(e) => failure(name.as_deref().unwrap_or("bots"), "query", &e),
            },
            Command::Bots => match engine.status(owner, None).await {
                Ok(records) => Reply::ok(render_listing(&engine.stats(owner), &records)),
                Err(e) => failure("bots", "list", &e),
            },
            Command::StopAll => {
                let outcomes = engine.stop_all(owner).await;
                bulk_reply("Stopped", outcomes)
            }
            Command::RemoveAll => {
                let outcomes = engine.remove_all(owner).await;
                bulk_reply("Removed", outcomes)
            }
            Command::Help => Reply::ok(HELP),
        }
    }
}

fn lifecycle_reply(name: &str, action: &str, result: Result<Summary, EngineError>) -> Reply {
    match result {
        Ok(summary) => {
            let mut message = format!("Bot '{}' {}", name, summary.message);
            if let Some(handle) = &summary.handle {
                let _ = write!(message, " ({})", handle);
            }
            message.push('.');
            Reply::ok(message)
        }
        Err(e) => failure(name, action, &e),
    }
}

fn failure(name: &str, action: &str, err: &EngineError) -> Reply {
    let mut message = format!("Failed to {} '{}': {}", action, name, err);
    if err.is_retryable() {
        message.push_str(" (try again shortly)");
    }
    Reply::fail(message)
}

fn bulk_reply(verb: &str, outcomes: Vec<(String, Result<Summary, EngineError>)>) -> Reply {
    let done = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    let mut message = format!("{} {} bot(s).", verb, done);
    for (name, result) in &outcomes {
        if let Err(e) = result {
            let _ = write!(message, "\n{}: {}", name, e);
        }
    }
    Reply {
        success: done == outcomes.len(),
        message,
    }
}

fn status_label(status: WorkloadStatus) -> &'static str {
    match status {
        WorkloadStatus::Running => "RUNNING",
        WorkloadStatus::Starting => "STARTING",
        WorkloadStatus::Stopping => "STOPPING",
        WorkloadStatus::Stopped => "STOPPED",
        WorkloadStatus::Building => "BUILDING",
        WorkloadStatus::Error => "ERROR",
    }
}

fn render_listing(stats: &Stats, records: &[WorkloadRecord]) -> String {
    let mut text = format!(
        "Bots: {} total | {} running | {} stopped | {} error",
        stats.total, stats.running, stats.stopped, stats.error
    );
    if stats.building > 0 {
        let _ = write!(text, " | {} building", stats.building);
    }
    if records.is_empty() {
        text.push_str("\n\nNo bots deployed yet. Use /deploy to add one.");
        return text;
    }
    for (idx, record) in records.iter().enumerate() {
        let _ = write!(
            text,
            "\n\n{}. {} [{}]\n   repo: {}",
            idx + 1,
            record.name,
            status_label(record.status),
            record.source_url
        );
    }
    text
}

fn render_detail(record: &WorkloadRecord) -> String {
    let mut text = format!(
        "{}\nstatus: {}\nruntime: {} ({} backend)\nrepo: {}\nentry: {}\ntoken: {}",
        record.name,
        status_label(record.status),
        record.runtime_kind,
        record.backend_kind,
        record.source_url,
        if record.entry_point.is_empty() {
            "<image default>"
        } else {
            record.entry_point.as_str()
        },
        record.masked_token()
    );
    if let Some(handle) = &record.handle {
        let _ = write!(text, "\nhandle: {}", handle);
    }
    if let Some(deployed) = &record.last_deployed_at {
        let _ = write!(text, "\nlast deployed: {}", deployed.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(error) = &record.last_error {
        let _ = write!(text, "\nlast error: {}", error);
    }
    text
}
