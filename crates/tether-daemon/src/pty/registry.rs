//! Session registry
//!
//! Owns every live shell session. Output of all sessions is published on a
//! single [`SessionEvent`] channel regardless of which ones are active; the
//! router decides what reaches the wire.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use regex::Regex;
use tokio::sync::mpsc;

use tether_core::config::SessionConfig;
use tether_core::error::SessionError;
use tether_core::time::current_time_millis;
use tether_protocol::{SessionId, SessionSummary, TerminalSize};

use super::backend::{PtyBackend, PtyProcess, SpawnRequest};
use super::buffer::{OutputBuffer, ScreenId};

/// Capacity of the session event channel.
///
/// Reader threads block once it is full, which throttles a chatty shell to
/// the speed of the event loop instead of growing memory.
pub const SESSION_EVENT_CHANNEL_CAPACITY: usize = 256;

const READ_CHUNK: usize = 4096;

/// Events published by session reader threads
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// New output; `revision` is the buffer revision after appending it
    Output {
        id: SessionId,
        data: String,
        revision: u64,
    },
    /// The terminal reached EOF. `generation` tells a recreated session with
    /// the same id apart from the one that exited.
    Exited { id: SessionId, generation: u64 },
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: SessionId,
    pub name: String,
    pub created_at: u64,
    pub pid: Option<u32>,
}

/// Buffered output returned when a session becomes active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSnapshot {
    pub id: SessionId,
    pub data: String,
    /// Output events at or below this revision are already in `data`
    pub revision: u64,
}

/// Window of the screen counted in characters back from the end.
///
/// `start` is the farther edge, `end` the nearer one: `{ start: 100, end: 0 }`
/// is the last 100 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenWindow {
    pub start: usize,
    pub end: usize,
}

impl ScreenWindow {
    /// The most recent `chars` characters
    pub fn recent(chars: usize) -> Self {
        Self {
            start: chars,
            end: 0,
        }
    }
}

/// ANSI-stripped text of a screen window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenCapture {
    pub text: String,
    pub screen_id: ScreenId,
    /// Characters available in the whole buffer after stripping
    pub total_chars: usize,
}

struct SessionEntry {
    name: String,
    size: TerminalSize,
    created_at: u64,
    seq: u64,
    active: bool,
    buffer: Arc<Mutex<OutputBuffer>>,
    writer: Box<dyn Write + Send>,
    process: Box<dyn PtyProcess>,
    _reader: JoinHandle<()>,
}

/// Owns and multiplexes all shell sessions
pub struct SessionRegistry {
    backend: Arc<dyn PtyBackend>,
    config: SessionConfig,
    sessions: HashMap<SessionId, SessionEntry>,
    events_tx: mpsc::Sender<SessionEvent>,
    next_seq: u64,
    name_counter: u32,
}

impl SessionRegistry {
    /// Create a registry and the receiver for its session events
    pub fn new(
        backend: Arc<dyn PtyBackend>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_CAPACITY);
        let registry = Self {
            backend,
            config,
            sessions: HashMap::new(),
            events_tx,
            next_seq: 0,
            name_counter: 0,
        };
        (registry, events_rx)
    }

    /// Spawn a new session
    pub fn create(
        &mut self,
        id: SessionId,
        cols: Option<u16>,
        rows: Option<u16>,
        name: Option<String>,
    ) -> Result<SessionHandle, SessionError> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }

        let size = TerminalSize::new(
            cols.filter(|c| *c > 0).unwrap_or(self.config.default_cols),
            rows.filter(|r| *r > 0).unwrap_or(self.config.default_rows),
        );
        tracing::info!(session = %id, cols = size.cols, rows = size.rows, "Creating session");

        let request = SpawnRequest {
            shell: self.config.shell.clone(),
            env: self.config.env.clone(),
            size,
        };
        let spawned = self
            .backend
            .spawn(&request)
            .map_err(|e| SessionError::SpawnFailed {
                id: id.to_string(),
                reason: format!("{:#}", e),
            })?;

        let generation = self.next_seq + 1;
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.config.output_buffer_bytes)));
        let reader = spawn_reader(
            id.clone(),
            generation,
            spawned.reader,
            Arc::clone(&buffer),
            self.events_tx.clone(),
        )
        .map_err(|e| SessionError::SpawnFailed {
            id: id.to_string(),
            reason: format!("failed to start reader thread: {}", e),
        })?;

        self.name_counter += 1;
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Terminal {}", self.name_counter));
        let created_at = current_time_millis();
        let pid = spawned.process.pid();

        self.next_seq = generation;
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                name: name.clone(),
                size,
                created_at,
                seq: generation,
                active: false,
                buffer,
                writer: spawned.writer,
                process: spawned.process,
                _reader: reader,
            },
        );

        Ok(SessionHandle {
            id,
            name,
            created_at,
            pid,
        })
    }

    /// Kill and remove a session. Returns false for unknown ids.
    pub fn terminate(&mut self, id: &SessionId) -> bool {
        let Some(mut entry) = self.sessions.remove(id) else {
            tracing::debug!(session = %id, "Terminate for unknown session");
            return false;
        };

        tracing::info!(session = %id, "Terminating session");
        if let Err(e) = entry.process.kill() {
            tracing::warn!(session = %id, "Failed to kill session process: {:#}", e);
        }
        true
    }

    /// Remove a session after its reader reported EOF.
    ///
    /// Returns the exit code if known, or `UnknownSession` if the session was
    /// already terminated (or replaced by a newer session with the same id).
    pub fn reap(&mut self, id: &SessionId, generation: u64) -> Result<Option<i32>, SessionError> {
        if self.sessions.get(id).map(|e| e.seq) != Some(generation) {
            return Err(SessionError::UnknownSession(id.to_string()));
        }
        let mut entry = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;

        let exit_code = match entry.process.try_wait() {
            Ok(code) => code,
            Err(e) => {
                tracing::debug!(session = %id, "Could not read exit status: {:#}", e);
                None
            }
        };
        tracing::info!(session = %id, ?exit_code, "Session exited");
        Ok(exit_code)
    }

    /// Forward input to a session; unknown or dead sessions are a logged no-op
    pub fn write(&mut self, id: &SessionId, data: &[u8]) -> bool {
        let Some(entry) = self.sessions.get_mut(id) else {
            tracing::debug!(session = %id, "Input for unknown session dropped");
            return false;
        };

        let result = entry
            .writer
            .write_all(data)
            .and_then(|_| entry.writer.flush());
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session = %id, "Failed to write to session: {}", e);
                false
            }
        }
    }

    /// Resize one session
    pub fn resize(&mut self, id: &SessionId, cols: u16, rows: u16) -> bool {
        let Some(entry) = self.sessions.get_mut(id) else {
            tracing::debug!(session = %id, "Resize for unknown session ignored");
            return false;
        };
        resize_entry(id, entry, TerminalSize::new(cols, rows))
    }

    /// Resize every session
    pub fn resize_all(&mut self, cols: u16, rows: u16) {
        let size = TerminalSize::new(cols, rows);
        for (id, entry) in self.sessions.iter_mut() {
            resize_entry(id, entry, size);
        }
    }

    /// Make exactly `ids` active.
    ///
    /// Returns a snapshot of the buffered output for every session that was
    /// inactive before, in the order given.
    pub fn set_active(&mut self, ids: &[SessionId]) -> Vec<ScreenSnapshot> {
        let mut newly_active = Vec::new();
        for (id, entry) in self.sessions.iter_mut() {
            let now_active = ids.contains(id);
            if now_active && !entry.active {
                newly_active.push(id.clone());
            }
            entry.active = now_active;
        }

        for id in ids {
            if !self.sessions.contains_key(id) {
                tracing::debug!(session = %id, "Ignoring unknown id in active set");
            }
        }

        ids.iter()
            .filter(|id| newly_active.contains(*id))
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    /// Buffered output of a session, active or not
    pub fn snapshot(&self, id: &SessionId) -> Option<ScreenSnapshot> {
        let entry = self.sessions.get(id)?;
        let buffer = entry.buffer.lock().ok()?;
        Some(ScreenSnapshot {
            id: id.clone(),
            data: buffer.contents(),
            revision: buffer.revision(),
        })
    }

    /// Change a session's display name
    pub fn rename(&mut self, id: &SessionId, name: impl Into<String>) -> bool {
        match self.sessions.get_mut(id) {
            Some(entry) => {
                entry.name = name.into();
                true
            }
            None => false,
        }
    }

    fn ordered(&self) -> Vec<(&SessionId, &SessionEntry)> {
        let mut entries: Vec<_> = self.sessions.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
    }

    /// Sessions in creation order, for `processes:sync`
    pub fn list_for_sync(&self) -> Vec<SessionSummary> {
        self.ordered()
            .into_iter()
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                name: entry.name.clone(),
                created_at: entry.created_at,
                working_directory: entry
                    .process
                    .pid()
                    .and_then(process_cwd)
                    .map(|path| path.display().to_string()),
            })
            .collect()
    }

    /// Active session ids in creation order
    pub fn active_ids(&self) -> Vec<SessionId> {
        self.ordered()
            .into_iter()
            .filter(|(_, entry)| entry.active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether `id` is in the active set
    pub fn is_active(&self, id: &SessionId) -> bool {
        self.sessions.get(id).map(|e| e.active).unwrap_or(false)
    }

    /// Whether `id` names a live session
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Display name of a session
    pub fn name(&self, id: &SessionId) -> Option<String> {
        self.sessions.get(id).map(|e| e.name.clone())
    }

    /// Current size of a session
    pub fn size(&self, id: &SessionId) -> Option<TerminalSize> {
        self.sessions.get(id).map(|e| e.size)
    }

    /// Current screen token of a session
    pub fn screen_id(&self, id: &SessionId) -> Option<ScreenId> {
        let entry = self.sessions.get(id)?;
        let buffer = entry.buffer.lock().ok()?;
        Some(buffer.screen_id())
    }

    /// ANSI-stripped text of a window of the session's screen
    pub fn capture(
        &self,
        id: &SessionId,
        window: ScreenWindow,
    ) -> Result<ScreenCapture, SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;

        let (raw, screen_id) = {
            let buffer = entry
                .buffer
                .lock()
                .map_err(|_| SessionError::UnknownSession(id.to_string()))?;
            (buffer.contents(), buffer.screen_id())
        };

        let chars: Vec<char> = strip_ansi(&raw).chars().collect();
        let total_chars = chars.len();
        let (far, near) = if window.start >= window.end {
            (window.start, window.end)
        } else {
            (window.end, window.start)
        };
        let from = total_chars.saturating_sub(far);
        let to = total_chars.saturating_sub(near);

        Ok(ScreenCapture {
            text: chars[from..to].iter().collect(),
            screen_id,
            total_chars,
        })
    }

    /// Best-effort current working directory of the session's shell
    pub fn working_directory(&self, id: &SessionId) -> Option<PathBuf> {
        let pid = self.sessions.get(id)?.process.pid()?;
        process_cwd(pid)
    }

    /// Terminate every session; safe to call repeatedly
    pub fn cleanup(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Cleaning up sessions");
        }
        for id in ids {
            self.terminate(&id);
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn resize_entry(id: &SessionId, entry: &mut SessionEntry, size: TerminalSize) -> bool {
    match entry.process.resize(size) {
        Ok(()) => {
            entry.size = size;
            true
        }
        Err(e) => {
            tracing::warn!(session = %id, "Failed to resize session: {:#}", e);
            false
        }
    }
}

/// Split off the longest valid UTF-8 prefix of `carry`.
///
/// An incomplete sequence at the end stays in `carry` for the next read;
/// invalid bytes elsewhere are replaced.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = carry.split_off(valid);
            let text = String::from_utf8_lossy(carry).into_owned();
            *carry = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

/// Read a session's output on a dedicated thread until EOF
fn spawn_reader(
    id: SessionId,
    generation: u64,
    mut reader: Box<dyn Read + Send>,
    buffer: Arc<Mutex<OutputBuffer>>,
    events_tx: mpsc::Sender<SessionEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", id))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            let mut carry = Vec::new();

            let publish = |data: String| -> bool {
                if data.is_empty() {
                    return true;
                }
                let revision = match buffer.lock() {
                    Ok(mut buffer) => buffer.append(data.as_bytes()),
                    Err(_) => return false,
                };
                events_tx
                    .blocking_send(SessionEvent::Output {
                        id: id.clone(),
                        data,
                        revision,
                    })
                    .is_ok()
            };

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!(session = %id, "PTY reader EOF");
                        break;
                    }
                    Ok(n) => {
                        carry.extend_from_slice(&buf[..n]);
                        let text = take_utf8(&mut carry);
                        if !publish(text) {
                            tracing::debug!(session = %id, "Session event channel closed");
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports the other side of the pty closing
                        tracing::debug!(session = %id, "PTY reader closed: {}", e);
                        break;
                    }
                }
            }

            if !carry.is_empty() {
                let rest = String::from_utf8_lossy(&carry).into_owned();
                publish(rest);
            }
            let _ = events_tx.blocking_send(SessionEvent::Exited {
                id: id.clone(),
                generation,
            });
            tracing::debug!(session = %id, "PTY reader thread exiting");
        })
}

fn ansi_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    // CSI sequences, OSC sequences (BEL or ST terminated), then two-byte escapes
    PATTERN
        .get_or_init(|| {
            Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
                .ok()
        })
        .as_ref()
}

/// Remove terminal escape sequences and carriage returns
pub fn strip_ansi(text: &str) -> String {
    let stripped = match ansi_pattern() {
        Some(pattern) => pattern.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    stripped.replace("\r\n", "\n").replace('\r', "")
}

#[cfg(target_os = "linux")]
fn process_cwd(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{}/cwd", pid)).ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_cwd(pid: u32) -> Option<PathBuf> {
    let output = std::process::Command::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix('n'))
        .map(PathBuf::from)
}

#[cfg(not(unix))]
fn process_cwd(_pid: u32) -> Option<PathBuf> {
    None
}
