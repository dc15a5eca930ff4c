use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slate::config::ConfigError;
use slate::markup::{is_empty_markup, plain_text};
use slate::telemetry;
use slate::{DocumentStore, FileStore, SlateConfig, Tab, TabsState};

const PREVIEW_CHARS: usize = 60;

#[derive(Debug, Parser)]
#[command(
    name = "slate",
    about = "Tabbed scratchpad with margin notes, stored locally",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Directory holding the saved tabs (overrides the config file).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Config file to use instead of `slate.json` in the data directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List tabs and their margin notes.
    Show(ShowArgs),

    /// Open a new tab and make it active.
    NewTab(NewTabArgs),

    /// Close a tab. The last remaining tab stays.
    CloseTab(TabArgs),

    /// Make a tab the active one.
    Switch(TabArgs),

    /// Rename a tab. Blank titles fall back to "Untitled".
    Rename(RenameArgs),

    /// Replace a tab's body with the given markup.
    Write(WriteArgs),

    /// Add, edit or remove margin notes.
    #[command(subcommand)]
    Note(NoteCommands),

    /// Print or save the stored projection as JSON.
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
enum NoteCommands {
    /// Attach a new note to a tab.
    Add(NoteAddArgs),
    /// Replace a note's content. Emptying a note removes it.
    Edit(NoteEditArgs),
    /// Remove a note.
    Rm(NoteRmArgs),
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Emit the full in-memory snapshot as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NewTabArgs {
    /// Title for the new tab.
    #[arg(long)]
    title: Option<String>,
}

/// Tabs are selected by id, 1-based position, or title (first match).
#[derive(Debug, Args)]
struct TabArgs {
    tab: String,
}

#[derive(Debug, Args)]
struct RenameArgs {
    tab: String,
    title: String,
}

#[derive(Debug, Args)]
struct WriteArgs {
    tab: String,
    content: String,
}

#[derive(Debug, Args)]
struct NoteAddArgs {
    tab: String,
    content: String,
}

/// Notes are selected by id or 1-based position within the tab.
#[derive(Debug, Args)]
struct NoteEditArgs {
    tab: String,
    note: String,
    content: String,
}

#[derive(Debug, Args)]
struct NoteRmArgs {
    tab: String,
    note: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Write to this path instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_problem) = resolve_config(cli.config.as_deref(), cli.data_dir)?;
    telemetry::init(&config.log_level, cli.verbose);
    if let Some(err) = config_problem {
        tracing::warn!("ignoring config, using defaults: {err}");
    }
    run(cli.command, &config)
}

/// An explicit `--config` must load. The implicit `slate.json` is best effort: a broken
/// file is reported back and defaults are used.
fn resolve_config(
    explicit: Option<&Path>,
    data_dir: Option<PathBuf>,
) -> Result<(SlateConfig, Option<ConfigError>)> {
    let (mut config, problem) = match explicit {
        Some(path) => (
            SlateConfig::from_path(path).with_context(|| format!("loading config {:?}", path))?,
            None,
        ),
        None => {
            let dir = data_dir
                .clone()
                .unwrap_or_else(|| SlateConfig::default().data_dir);
            match SlateConfig::from_dir(&dir) {
                Ok(found) => (found.unwrap_or_default(), None),
                Err(err) => (SlateConfig::default(), Some(err)),
            }
        }
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok((config, problem))
}

fn run(command: Commands, config: &SlateConfig) -> Result<()> {
    let backend = FileStore::open(config.data_dir.clone())
        .with_context(|| format!("opening data directory {:?}", config.data_dir))?;
    let mut store = DocumentStore::new(backend, config.store_options());
    store.load();

    match command {
        Commands::Show(ShowArgs { json }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(store.state())?);
            } else {
                print!("{}", render_state(store.state()));
            }
        }
        Commands::NewTab(NewTabArgs { title }) => {
            let tab = store.create_tab();
            if let Some(title) = title {
                store.update_tab_title(&tab.id, &title);
            }
            println!("Opened {}", tab.id);
        }
        Commands::CloseTab(TabArgs { tab }) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            if !store.can_close_tab() {
                anyhow::bail!("cannot close the last remaining tab");
            }
            store.delete_tab(&tab_id);
            if let Some(active) = store.active_tab() {
                println!("Closed {tab_id}; active tab is now {:?}", active.title);
            }
        }
        Commands::Switch(TabArgs { tab }) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            store.set_active_tab(&tab_id);
        }
        Commands::Rename(RenameArgs { tab, title }) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            store.update_tab_title(&tab_id, &title);
        }
        Commands::Write(WriteArgs { tab, content }) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            store.update_tab_content(&tab_id, &content);
        }
        Commands::Note(NoteCommands::Add(NoteAddArgs { tab, content })) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            if is_empty_markup(&content) {
                anyhow::bail!("note has no visible text; empty notes are not saved");
            }
            let note = store.create_margin_note(&tab_id);
            store.update_margin_note(&tab_id, &note.id, &content);
            println!("Added {}", note.id);
        }
        Commands::Note(NoteCommands::Edit(NoteEditArgs { tab, note, content })) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            let note_id = resolve_note(store.state().tab(&tab_id)?, &note)?;
            store.update_margin_note(&tab_id, &note_id, &content);
            if store.discard_note_if_empty(&tab_id, &note_id) {
                println!("Removed {note_id}; it no longer had any text");
            }
        }
        Commands::Note(NoteCommands::Rm(NoteRmArgs { tab, note })) => {
            let tab_id = resolve_tab(store.state(), &tab)?;
            let note_id = resolve_note(store.state().tab(&tab_id)?, &note)?;
            store.delete_margin_note(&tab_id, &note_id);
        }
        Commands::Export(ExportArgs { output }) => {
            let json = serde_json::to_string_pretty(&store.state().project())?;
            match output {
                Some(path) => {
                    fs::write(&path, json.as_bytes())
                        .with_context(|| format!("writing {:?}", path))?;
                    println!("Exported tabs to {:?}", path);
                }
                None => println!("{json}"),
            }
        }
    }

    store.flush();
    Ok(())
}

fn resolve_tab(state: &TabsState, selector: &str) -> Result<String> {
    if let Some(tab) = state.tabs.iter().find(|t| t.id == selector) {
        return Ok(tab.id.clone());
    }
    if let Ok(position) = selector.parse::<usize>() {
        if let Some(tab) = position.checked_sub(1).and_then(|i| state.tabs.get(i)) {
            return Ok(tab.id.clone());
        }
    }
    if let Some(tab) = state.tabs.iter().find(|t| t.title == selector) {
        return Ok(tab.id.clone());
    }
    anyhow::bail!("no tab matches {selector:?}")
}

fn resolve_note(tab: &Tab, selector: &str) -> Result<String> {
    if let Ok(note) = tab.note(selector) {
        return Ok(note.id.clone());
    }
    if let Ok(position) = selector.parse::<usize>() {
        if let Some(note) = position.checked_sub(1).and_then(|i| tab.margin_notes.get(i)) {
            return Ok(note.id.clone());
        }
    }
    anyhow::bail!("no margin note matches {selector:?} in tab {:?}", tab.title)
}

fn render_state(state: &TabsState) -> String {
    let mut out = String::new();
    for (idx, tab) in state.tabs.iter().enumerate() {
        let marker = if state.is_active(&tab.id) { '*' } else { ' ' };
        out.push_str(&format!("{marker} {}. {}  [{}]\n", idx + 1, tab.title, tab.id));
        let body = preview(&tab.content);
        if !body.is_empty() {
            out.push_str(&format!("      {body}\n"));
        }
        for (n, note) in tab.margin_notes.iter().enumerate() {
            out.push_str(&format!(
                "      - {}: {}  [{}]\n",
                n + 1,
                preview(&note.content),
                note.id
            ));
        }
    }
    out
}

fn preview(markup: &str) -> String {
    let collapsed = plain_text(markup)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut line: String = collapsed.chars().take(PREVIEW_CHARS).collect();
    if collapsed.chars().count() > PREVIEW_CHARS {
        line.push('…');
    }
    line
}
