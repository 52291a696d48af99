//! Record/playback store for external command outputs and file reads.
//!
//! Under `Playback` every command invocation must match an entry by its
//! mockup key (the normalized command line, unless the call site sets an
//! explicit key); unmatched keys are an error. `occams_razor` optionally
//! fails when entries remained unused after probing.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    sync::Mutex,
};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::errors::FileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    None,
    Record,
    Playback,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    #[serde(default)]
    pub exit_code: i32,
}

impl Command {
    pub fn from_stdout(stdout: Vec<String>) -> Self {
        Command { stdout, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Data {
    #[serde(default)]
    commands: BTreeMap<String, Command>,
    #[serde(default)]
    files: BTreeMap<String, Vec<String>>,
}

#[derive(Default)]
struct State {
    mode: Mode,
    data: Data,
    used_commands: BTreeSet<String>,
    used_files: BTreeSet<String>,
}

lazy_static! {
    static ref STATE: Mutex<State> = Mutex::new(State::default());
}

pub fn mode() -> Mode {
    STATE.lock().unwrap().mode
}

pub fn set_mode(mode: Mode) {
    STATE.lock().unwrap().mode = mode;
}

/// Drop all entries and usage marks, keeping the mode.
pub fn clear() {
    let mut state = STATE.lock().unwrap();
    state.data = Data::default();
    state.used_commands.clear();
    state.used_files.clear();
}

pub fn load(filename: impl AsRef<Path>) -> std::io::Result<()> {
    let text = fs::read_to_string(filename.as_ref())?;
    let data: Data = serde_json::from_str(&text)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut state = STATE.lock().unwrap();
    state.data = data;
    state.used_commands.clear();
    state.used_files.clear();
    Ok(())
}

pub fn save(filename: impl AsRef<Path>) -> std::io::Result<()> {
    let state = STATE.lock().unwrap();
    let text = serde_json::to_string_pretty(&state.data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(filename.as_ref(), text)
}

pub fn has_command(key: &str) -> bool {
    STATE.lock().unwrap().data.commands.contains_key(key)
}

/// Look up a command entry and mark it used.
pub fn command(key: &str) -> Option<Command> {
    let mut state = STATE.lock().unwrap();
    let found = state.data.commands.get(key).cloned();
    if found.is_some() {
        state.used_commands.insert(key.to_owned());
    }
    found
}

pub fn set_command(key: impl Into<String>, command: Command) {
    STATE.lock().unwrap().data.commands.insert(key.into(), command);
}

pub fn erase_command(key: &str) {
    STATE.lock().unwrap().data.commands.remove(key);
}

pub fn has_file(path: &str) -> bool {
    STATE.lock().unwrap().data.files.contains_key(path)
}

/// Look up a file entry and mark it used.
pub fn file(path: &str) -> Option<Vec<String>> {
    let mut state = STATE.lock().unwrap();
    let found = state.data.files.get(path).cloned();
    if found.is_some() {
        state.used_files.insert(path.to_owned());
    }
    found
}

pub fn set_file(path: impl Into<String>, lines: Vec<String>) {
    STATE.lock().unwrap().data.files.insert(path.into(), lines);
}

/// Read a file through the mockup: served from the store under `Playback`,
/// recorded under `Record`, plain read otherwise.
pub fn read_file(path: &str) -> Result<Vec<String>, FileError> {
    match mode() {
        Mode::Playback => file(path).ok_or_else(|| FileError::NoMockup { path: path.to_owned() }),
        Mode::Record => {
            let lines = plain_read(path)?;
            set_file(path, lines.clone());
            Ok(lines)
        }
        Mode::None => plain_read(path),
    }
}

fn plain_read(path: &str) -> Result<Vec<String>, FileError> {
    let text = fs::read_to_string(path).map_err(|source| FileError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(text.lines().map(str::to_owned).collect())
}

/// Entries that were loaded but never served.
pub fn unused_entries() -> Vec<String> {
    let state = STATE.lock().unwrap();
    let mut unused: Vec<String> = state
        .data
        .commands
        .keys()
        .filter(|k| !state.used_commands.contains(*k))
        .map(|k| format!("command: {k}"))
        .collect();
    unused.extend(
        state
            .data
            .files
            .keys()
            .filter(|k| !state.used_files.contains(*k))
            .map(|k| format!("file: {k}")),
    );
    unused
}

/// Fail when entries remain unused, to keep mockup files minimal.
pub fn occams_razor() -> Result<(), String> {
    let unused = unused_entries();
    if unused.is_empty() {
        Ok(())
    } else {
        Err(format!("unused mockup entries: {}", unused.join(", ")))
    }
}
