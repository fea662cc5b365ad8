//! In-memory PTY backend
//!
//! Each spawned "process" is a pair of channels: bytes pushed through a
//! [`MemoryTerminal`] show up as terminal output, and everything the registry
//! writes is recorded for inspection.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use tether_protocol::TerminalSize;

use super::backend::{PtyBackend, PtyProcess, SpawnRequest, SpawnedPty};

#[derive(Default)]
struct TerminalState {
    output_tx: Option<Sender<Vec<u8>>>,
    input: Vec<u8>,
    size: TerminalSize,
    exit_code: Option<i32>,
    killed: bool,
}

/// Test-side handle to one in-memory terminal
#[derive(Clone)]
pub struct MemoryTerminal {
    state: Arc<Mutex<TerminalState>>,
}

impl MemoryTerminal {
    /// Emit output as if the shell had printed it
    pub fn emit(&self, data: impl AsRef<[u8]>) {
        if let Ok(state) = self.state.lock() {
            if let Some(tx) = &state.output_tx {
                let _ = tx.send(data.as_ref().to_vec());
            }
        }
    }

    /// Simulate the shell exiting with `code`
    pub fn exit(&self, code: i32) {
        if let Ok(mut state) = self.state.lock() {
            state.exit_code = Some(code);
            state.output_tx = None;
        }
    }

    /// Everything written to the terminal so far
    pub fn input(&self) -> Vec<u8> {
        self.state
            .lock()
            .map(|s| s.input.clone())
            .unwrap_or_default()
    }

    /// Input decoded as text
    pub fn input_string(&self) -> String {
        String::from_utf8_lossy(&self.input()).into_owned()
    }

    /// Last size applied
    pub fn size(&self) -> TerminalSize {
        self.state.lock().map(|s| s.size).unwrap_or_default()
    }

    /// Whether the registry killed this terminal
    pub fn is_killed(&self) -> bool {
        self.state.lock().map(|s| s.killed).unwrap_or(false)
    }
}

/// Backend producing [`MemoryTerminal`]s
#[derive(Clone, Default)]
pub struct MemoryBackend {
    terminals: Arc<Mutex<Vec<MemoryTerminal>>>,
    failing_shells: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make spawning `shell` fail with `reason`
    pub fn fail_shell(&self, shell: impl Into<String>, reason: impl Into<String>) {
        if let Ok(mut failing) = self.failing_shells.lock() {
            failing.insert(shell.into(), reason.into());
        }
    }

    /// Terminal spawned `index`-th (0-based)
    pub fn terminal(&self, index: usize) -> Option<MemoryTerminal> {
        self.terminals.lock().ok()?.get(index).cloned()
    }

    /// Most recently spawned terminal
    pub fn last(&self) -> Option<MemoryTerminal> {
        self.terminals.lock().ok()?.last().cloned()
    }

    /// Number of terminals spawned so far
    pub fn spawned(&self) -> usize {
        self.terminals.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl PtyBackend for MemoryBackend {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty> {
        if let Some(shell) = &request.shell {
            let failing = self
                .failing_shells
                .lock()
                .map_err(|_| anyhow::anyhow!("backend state poisoned"))?;
            if let Some(reason) = failing.get(shell) {
                anyhow::bail!("{}", reason);
            }
        }

        let (output_tx, output_rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(TerminalState {
            output_tx: Some(output_tx),
            size: request.size,
            ..Default::default()
        }));

        let terminal = MemoryTerminal {
            state: Arc::clone(&state),
        };
        self.terminals
            .lock()
            .map_err(|_| anyhow::anyhow!("backend state poisoned"))?
            .push(terminal);

        Ok(SpawnedPty {
            reader: Box::new(ChannelReader {
                rx: output_rx,
                pending: Vec::new(),
            }),
            writer: Box::new(RecordingWriter {
                state: Arc::clone(&state),
            }),
            process: Box::new(MemoryProcess { state }),
        })
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                // All senders gone: the "process" exited
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct RecordingWriter {
    state: Arc<Mutex<TerminalState>>,
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "terminal state poisoned"))?;
        if state.killed || state.exit_code.is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"));
        }
        state.input.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemoryProcess {
    state: Arc<Mutex<TerminalState>>,
}

impl PtyProcess for MemoryProcess {
    /// The test process stands in for the shell
    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn resize(&mut self, size: TerminalSize) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("terminal state poisoned"))?;
        state.size = size;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("terminal state poisoned"))?;
        state.killed = true;
        state.output_tx = None;
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("terminal state poisoned"))?;
        Ok(state.exit_code)
    }
}
