//! CLI (Command Line Interface) mode
//!
//! Interactive REPL: free text is ingested as a new appointment, slash
//! commands inspect and edit what is already on file. One-shot modes for a
//! single message or a single business mail live here too.

use std::borrow::Cow;
use std::path::Path;

use appt_calendar::StoreQuery;
use appt_core::{Appointment, AppointmentPatch, SyncState};
use appt_email::{MailIngestor, MailOutcome};
use appt_extract::ExtractionResult;
use appt_sync::SyncOutcome;
use nu_ansi_term::{Color, Style};
use reedline::{
    ColumnarMenu, Completer, DefaultHinter, Emacs, KeyCode, KeyModifiers, Keybindings,
    MenuBuilder, Prompt, Reedline, ReedlineEvent, ReedlineMenu, Signal, Suggestion,
};
use tracing::info;

use crate::service::{AppointmentService, IngestOutcome};

/// Available commands for autocomplete display
const COMMANDS: &[(&str, &str)] = &[
    ("/list", "List appointments"),
    ("/show", "Show one appointment: /show <id>"),
    ("/shared", "List the shared partner calendar"),
    ("/rename", "Change the title: /rename <id> <title>"),
    ("/toggle", "Flip partner visibility: /toggle <id>"),
    ("/delete", "Delete an appointment: /delete <id>"),
    ("/resync", "Retry syncing to the shared calendar: /resync <id>"),
    ("/status", "Show sync status: /status <id>"),
    ("/help", "Show help"),
    ("/exit", "Exit"),
];

/// Characters of an id shown in listings; any unique prefix is accepted back
const SHORT_ID: usize = 8;

/// A parsed line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Show(String),
    Shared,
    Rename { id: String, title: String },
    Toggle(String),
    Delete(String),
    Resync(String),
    Status(String),
    Help,
    Exit,
    /// Plain text to turn into an appointment
    Ingest(String),
    /// Slash command that is unknown or lacks its argument
    Invalid(String),
}

impl Command {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if !input.starts_with('/') {
            return Self::Ingest(input.to_string());
        }

        let (name, arg) = match input.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (input, ""),
        };
        let needs_id = |make: fn(String) -> Self| {
            if arg.is_empty() {
                Self::Invalid(format!("{} needs an appointment id", name))
            } else {
                make(arg.to_string())
            }
        };

        match name.to_lowercase().as_str() {
            "/list" | "/ls" => Self::List,
            "/show" => needs_id(Self::Show),
            "/shared" => Self::Shared,
            "/rename" => match arg.split_once(char::is_whitespace) {
                Some((id, title)) if !title.trim().is_empty() => Self::Rename {
                    id: id.to_string(),
                    title: title.trim().to_string(),
                },
                _ => Self::Invalid("/rename needs an appointment id and a new title".to_string()),
            },
            "/toggle" => needs_id(Self::Toggle),
            "/delete" | "/rm" => needs_id(Self::Delete),
            "/resync" => needs_id(Self::Resync),
            "/status" => needs_id(Self::Status),
            "/help" | "/?" => Self::Help,
            "/exit" | "/quit" | "/q" => Self::Exit,
            _ => Self::Invalid(format!("Unknown command: {}", name)),
        }
    }
}

/// Command completer for reedline
#[derive(Clone)]
pub struct CommandCompleter {
    commands: Vec<(&'static str, &'static str)>,
}

impl CommandCompleter {
    pub fn new() -> Self {
        Self {
            commands: COMMANDS.to_vec(),
        }
    }
}

impl Default for CommandCompleter {
    fn default() -> Self {
        Self::new()
    }
}

impl Completer for CommandCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        if !line.starts_with('/') || line.contains(' ') {
            return Vec::new();
        }

        self.commands
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(line))
            .map(|(cmd, desc)| Suggestion {
                value: cmd.to_string(),
                description: Some(desc.to_string()),
                extra: None,
                span: reedline::Span::new(0, pos),
                append_whitespace: true,
                style: None,
            })
            .collect()
    }
}

/// Prompt showing the active user
struct ColoredPrompt {
    user_id: String,
    style: Style,
}

impl ColoredPrompt {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            style: Color::Cyan.bold(),
        }
    }
}

impl Prompt for ColoredPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        Cow::Owned(self.style.paint(format!("{}> ", self.user_id)).to_string())
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_history_search_indicator(
        &self,
        _history_search: reedline::PromptHistorySearch,
    ) -> Cow<'_, str> {
        Cow::Borrowed("")
    }
}

/// Run CLI interactive mode for `user_id`
pub async fn run_cli(service: &AppointmentService, user_id: &str) -> anyhow::Result<()> {
    let timezone = service.context(user_id)?.timezone;
    info!(user = %user_id, timezone = %timezone, "Starting CLI mode");

    print_welcome(user_id, &service.user_ids());

    let mut keybindings = default_keybindings();
    // Trigger completion on '/' key
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Char('/'),
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );

    let menu = Box::new(
        ColumnarMenu::default()
            .with_name("command_menu")
            .with_columns(1)
            .with_column_width(Some(60))
            .with_only_buffer_difference(false),
    );
    let hinter = DefaultHinter::default().with_style(Style::new().dimmed());

    let mut line_editor = Reedline::create()
        .with_completer(Box::new(CommandCompleter::new()))
        .with_menu(ReedlineMenu::EngineCompleter(menu))
        .with_hinter(Box::new(hinter))
        .with_edit_mode(Box::new(Emacs::new(keybindings)));

    let prompt = ColoredPrompt::new(user_id);

    loop {
        match line_editor.read_line(&prompt) {
            Ok(Signal::Success(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Command::Exit => {
                        println!("\nBye!\n");
                        break;
                    }
                    command => {
                        if let Err(e) = execute(service, user_id, command).await {
                            eprintln!("\n{} {}\n", Color::Red.paint("Error:"), e);
                        }
                    }
                }
            }
            Ok(Signal::CtrlC) => {
                println!("^C");
                continue;
            }
            Ok(Signal::CtrlD) => {
                println!("\nBye!\n");
                break;
            }
            Err(err) => {
                eprintln!("\n{} {}\n", Color::Red.paint("Error:"), err);
                break;
            }
        }
    }

    let pending = service.dispatcher().pending();
    if pending > 0 {
        info!(pending, "Exiting with sync tasks still queued");
    }
    Ok(())
}

async fn execute(service: &AppointmentService, user_id: &str, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => {
            let records = service.list(user_id).await?;
            println!();
            if records.is_empty() {
                println!("No appointments yet. Describe one to add it.");
            }
            for record in &records {
                println!("{}", format_line(record));
            }
            println!();
        }
        Command::Show(prefix) => {
            let id = resolve_id(service, user_id, &prefix).await?;
            let record = service.get(user_id, &id).await?;
            println!("\n{}\n", format_detail(&record));
        }
        Command::Shared => {
            let mut records = service
                .shared_store()
                .find(&StoreQuery::title_prefix(""))
                .await?;
            records.sort_by_key(|r| r.start);
            println!();
            if records.is_empty() {
                println!("The shared calendar is empty.");
            }
            for record in &records {
                let owner = record.tracking.source_user_id.as_deref().unwrap_or("entered by hand");
                println!("{}  {}", format_line(record), Color::DarkGray.paint(format!("({})", owner)));
            }
            println!();
        }
        Command::Rename { id, title } => {
            let id = resolve_id(service, user_id, &id).await?;
            let patch = AppointmentPatch {
                title: Some(title),
                ..Default::default()
            };
            let ticket = service.update(user_id, &id, &patch).await?;
            println!("\n{} Renamed{}\n", Color::Green.paint("✓"), queued_note(ticket.is_some()));
        }
        Command::Toggle(prefix) => {
            let id = resolve_id(service, user_id, &prefix).await?;
            let (relevant, ticket) = service.toggle(user_id, &id).await?;
            let state = if relevant { "now shared with your partner" } else { "now private" };
            println!("\n{} {}{}\n", Color::Green.paint("✓"), state, queued_note(ticket.is_some()));
        }
        Command::Delete(prefix) => {
            let id = resolve_id(service, user_id, &prefix).await?;
            let ticket = service.delete(user_id, &id).await?;
            println!("\n{} Deleted{}\n", Color::Green.paint("✓"), queued_note(ticket.is_some()));
        }
        Command::Resync(prefix) => {
            let id = resolve_id(service, user_id, &prefix).await?;
            match service.resync(user_id, &id).await? {
                Some(ticket) => {
                    let outcome = ticket.wait().await?;
                    println!("\n{} {}\n", Color::Green.paint("✓"), describe_sync(&outcome));
                }
                None => println!("\nNothing to sync: the appointment is private.\n"),
            }
        }
        Command::Status(prefix) => {
            let id = resolve_id(service, user_id, &prefix).await?;
            let status = service.sync_status(user_id, &id).await?;
            println!(
                "\n{} {}  partner: {}  mirror: {}\n",
                Style::new().bold().paint("sync:"),
                paint_state(status.state),
                if status.partner_relevant { "yes" } else { "no" },
                status.mirror_id.as_deref().unwrap_or("-")
            );
        }
        Command::Help => print_help(),
        Command::Exit => {}
        Command::Invalid(message) => {
            eprintln!("\n{} Type /help for the list of commands.\n", message);
        }
        Command::Ingest(text) => {
            let outcome = service.ingest(user_id, &text).await?;
            print_ingest(&outcome);
        }
    }
    Ok(())
}

/// Find the single record whose id starts with `prefix`
async fn resolve_id(service: &AppointmentService, user_id: &str, prefix: &str) -> anyhow::Result<String> {
    let matches: Vec<String> = service
        .list(user_id)
        .await?
        .into_iter()
        .filter_map(|r| r.id)
        .filter(|id| id.starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(anyhow::anyhow!("No appointment with id {}", prefix)),
        _ => Err(anyhow::anyhow!(
            "Id {} is ambiguous ({} matches), type more of it",
            prefix,
            matches.len()
        )),
    }
}

/// One-shot: ingest `text` for `user_id`, waiting for any sync to finish
pub async fn run_ingest(service: &AppointmentService, user_id: &str, text: &str) -> anyhow::Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow::anyhow!("Nothing to ingest: the text is empty"));
    }

    let outcome = service.ingest(user_id, text).await?;
    print_ingest(&outcome);

    if let IngestOutcome::Created { sync: Some(ticket), .. } = outcome {
        match ticket.wait().await {
            Ok(outcome) => println!("{} {}", Color::Green.paint("✓"), describe_sync(&outcome)),
            Err(e) => eprintln!("{} {}", Color::Yellow.paint("Sync failed:"), e),
        }
    }
    Ok(())
}

/// One-shot: file the appointment described by the mail at `path`
pub async fn run_mail(ingestor: &MailIngestor, path: &Path) -> anyhow::Result<()> {
    info!(path = %path.display(), "Importing business mail");
    match ingestor.ingest_file(path).await? {
        MailOutcome::Created { id, appointment } => {
            println!("{} Filed: {}", Color::Green.paint("✓"), format_line(&with_id(&appointment, &id)));
        }
        MailOutcome::Duplicate { existing_id } => {
            println!("Already on file as {}", short_id(&existing_id));
        }
        MailOutcome::NeedsReview { result } => {
            println!("{} {}", Color::Yellow.paint("Needs review:"), describe_unresolved(&result));
        }
    }
    Ok(())
}

fn print_ingest(outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Created { id, appointment, sync } => {
            println!(
                "\n{} Added: {}{}\n",
                Color::Green.paint("✓"),
                format_line(&with_id(appointment, id)),
                queued_note(sync.is_some())
            );
        }
        IngestOutcome::Duplicate { existing_id } => {
            println!("\nAlready on file as {}\n", short_id(existing_id));
        }
        IngestOutcome::NeedsClarification { result } => {
            println!(
                "\n{} {}\n",
                Color::Yellow.paint("Could you clarify?"),
                describe_unresolved(result)
            );
        }
    }
}

fn describe_unresolved(result: &ExtractionResult) -> String {
    let mut parts = Vec::new();
    if let Some(title) = &result.candidate.title {
        parts.push(format!("understood \"{}\"", title));
    }
    if !result.unresolved.is_empty() {
        parts.push(format!("missing {}", result.unresolved.join(", ")));
    }
    parts.push(format!("confidence {:.0}%", result.confidence * 100.0));
    parts.join("; ")
}

fn describe_sync(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Mirrored { mirror_id, .. } | SyncOutcome::Updated { mirror_id } => {
            format!("Shared calendar updated ({})", short_id(mirror_id))
        }
        SyncOutcome::Removed { .. } => "Removed from the shared calendar".to_string(),
        SyncOutcome::DuplicateSkipped { existing_id } => format!(
            "Shared calendar already has this ({}), nothing copied",
            short_id(existing_id)
        ),
        SyncOutcome::NothingToDo => "Nothing to sync".to_string(),
    }
}

fn with_id(appointment: &Appointment, id: &str) -> Appointment {
    let mut record = appointment.clone();
    record.id = Some(id.to_string());
    record
}

fn queued_note(queued: bool) -> &'static str {
    if queued { " (syncing to shared calendar)" } else { "" }
}

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID).unwrap_or(id)
}

fn paint_state(state: SyncState) -> String {
    let color = match state {
        SyncState::Synced => Color::Green,
        SyncState::Syncing => Color::Cyan,
        SyncState::SyncFailed => Color::Red,
        SyncState::Unsynced => Color::DarkGray,
    };
    color.paint(state.as_str()).to_string()
}

/// `<id>  <when>  <title>` with a partner marker
fn format_line(record: &Appointment) -> String {
    let id = record.id.as_deref().map(short_id).unwrap_or("--------");
    let marker = if record.partner_relevant { "♥" } else { " " };
    format!(
        "{}  {} {}  {}",
        Color::DarkGray.paint(id),
        marker,
        record.start.format("%a %Y-%m-%d %H:%M"),
        record.title
    )
}

fn format_detail(record: &Appointment) -> String {
    let mut lines = vec![
        Style::new().bold().paint(record.title.as_str()).to_string(),
        format!(
            "  when:     {} to {}",
            record.start.format("%a %Y-%m-%d %H:%M %:z"),
            record.end.format("%H:%M %:z")
        ),
    ];
    if let Some(location) = &record.location {
        lines.push(format!("  where:    {}", location));
    }
    if let Some(description) = &record.description {
        lines.push(format!("  notes:    {}", description));
    }
    if !record.tags.is_empty() {
        lines.push(format!("  tags:     {}", record.tags.join(", ")));
    }
    lines.push(format!(
        "  partner:  {}",
        if record.partner_relevant { "shared" } else { "private" }
    ));
    lines.push(format!("  sync:     {}", paint_state(record.tracking.sync_state)));
    if let Some(id) = &record.id {
        lines.push(format!("  id:       {}", id));
    }
    lines.join("\n")
}

/// Default keybindings for reedline
fn default_keybindings() -> Keybindings {
    let mut keybindings = Keybindings::new();
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Tab,
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Enter, ReedlineEvent::Submit);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Esc, ReedlineEvent::Esc);
    keybindings.add_binding(KeyModifiers::CONTROL, KeyCode::Char('c'), ReedlineEvent::CtrlC);
    keybindings.add_binding(KeyModifiers::CONTROL, KeyCode::Char('d'), ReedlineEvent::CtrlD);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Up, ReedlineEvent::Up);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Down, ReedlineEvent::Down);
    keybindings
}

fn print_welcome(user_id: &str, users: &[&str]) {
    println!();
    println!("{}", Color::Cyan.bold().paint("appt-gateway"));
    println!("Describe an appointment in your own words to add it, e.g.");
    println!("  dinner with Sam tomorrow at 7pm, share with partner");
    println!(
        "Signed in as {} (configured users: {}). Type / for commands.",
        user_id,
        users.join(", ")
    );
    println!();
}

fn print_help() {
    println!();
    println!("Commands:");
    for (cmd, desc) in COMMANDS {
        println!("  {:<10} {}", cmd, desc);
    }
    println!();
    println!("Ids may be shortened to any unique prefix.");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/list"), Command::List);
        assert_eq!(Command::parse("  /SHOW  0192ab "), Command::Show("0192ab".to_string()));
        assert_eq!(Command::parse("/rm 42"), Command::Delete("42".to_string()));
        assert_eq!(Command::parse("/quit"), Command::Exit);
        assert_eq!(
            Command::parse("lunch with Kim on friday"),
            Command::Ingest("lunch with Kim on friday".to_string())
        );
        assert_eq!(
            Command::parse("/rename 0192 Dinner at Luigi's"),
            Command::Rename {
                id: "0192".to_string(),
                title: "Dinner at Luigi's".to_string()
            }
        );
        assert!(matches!(Command::parse("/rename 0192"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/toggle"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/frobnicate"), Command::Invalid(_)));
    }

    #[test]
    fn test_completer_filters_by_prefix() {
        let mut completer = CommandCompleter::new();
        let values: Vec<String> = completer
            .complete("/s", 2)
            .into_iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec!["/show", "/shared", "/status"]);
        assert!(completer.complete("hello", 5).is_empty());
        assert!(completer.complete("/show 01", 8).is_empty());
    }

    #[test]
    fn test_format_line_and_detail() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut record = Appointment::new(
            "Dinner",
            tz.with_ymd_and_hms(2025, 6, 10, 19, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 6, 10, 20, 0, 0).unwrap(),
        )
        .with_location("Trattoria")
        .with_partner_relevant(true);
        record.id = Some("0192f3a4-aaaa-bbbb".to_string());

        let line = format_line(&record);
        assert!(line.contains("0192f3a4"));
        assert!(!line.contains("aaaa"));
        assert!(line.contains("Tue 2025-06-10 19:00"));
        assert!(line.contains("♥"));

        let detail = format_detail(&record);
        assert!(detail.contains("19:00 +02:00 to 20:00 +02:00"));
        assert!(detail.contains("where:    Trattoria"));
        assert!(detail.contains("id:       0192f3a4-aaaa-bbbb"));
    }

    #[test]
    fn test_short_id_handles_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789"), "01234567");
    }
}
