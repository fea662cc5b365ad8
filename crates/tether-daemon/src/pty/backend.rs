//! PTY backends
//!
//! The registry spawns processes through [`PtyBackend`] so it can run against
//! real pseudo-terminals (portable-pty) or the in-memory backend in tests.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

use tether_protocol::TerminalSize;

/// Allowed shell paths (prevents arbitrary command execution)
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

const ALLOWED_SHELLS_WINDOWS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "C:\\Windows\\System32\\cmd.exe",
    "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
];

/// Validate that a shell path is allowed and exists
pub fn validate_shell_path(shell: &str) -> Result<String> {
    let allowed = if cfg!(windows) {
        ALLOWED_SHELLS_WINDOWS
    } else {
        ALLOWED_SHELLS_UNIX
    };

    let is_allowed = allowed.iter().any(|s| s.eq_ignore_ascii_case(shell));

    if !is_allowed {
        // Anything listed in /etc/shells is accepted as well
        #[cfg(unix)]
        if let Ok(shells) = std::fs::read_to_string("/etc/shells") {
            let listed = shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell);
            if listed && Path::new(shell).exists() {
                return Ok(shell.to_string());
            }
        }

        anyhow::bail!("Shell '{}' is not in the allowed shell list", shell);
    }

    if !cfg!(windows) && !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

/// Parameters for spawning one shell
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Shell override (None = backend default)
    pub shell: Option<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Initial size
    pub size: TerminalSize,
}

/// Control handle for a spawned process
pub trait PtyProcess: Send {
    /// OS process id, when known
    fn pid(&self) -> Option<u32>;

    /// Resize the terminal
    fn resize(&mut self, size: TerminalSize) -> Result<()>;

    /// Kill the process
    fn kill(&mut self) -> Result<()>;

    /// Exit code if the process has exited
    fn try_wait(&mut self) -> Result<Option<i32>>;
}

/// A freshly spawned process and its I/O handles
pub struct SpawnedPty {
    /// Output of the terminal (blocking)
    pub reader: Box<dyn Read + Send>,
    /// Input to the terminal
    pub writer: Box<dyn Write + Send>,
    /// Process control
    pub process: Box<dyn PtyProcess>,
}

/// Something that can spawn shells attached to a terminal
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty>;
}

/// Backend using the platform's native pseudo-terminals
#[derive(Debug, Clone, Default)]
pub struct NativePtyBackend {
    default_shell: Option<String>,
}

impl NativePtyBackend {
    pub fn new(default_shell: Option<String>) -> Self {
        Self { default_shell }
    }

    fn resolve_shell(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .or_else(|| self.default_shell.clone())
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            })
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty> {
        let pair = native_pty_system()
            .openpty(pty_size(request.size))
            .context("Failed to open PTY")?;

        let requested = self.resolve_shell(request.shell.as_deref());
        let shell = validate_shell_path(&requested)
            .with_context(|| format!("Invalid shell requested: {}", requested))?;
        tracing::debug!(shell = %shell, "Using validated shell");

        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if let Some(home) = std::env::var_os("HOME") {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;
        // Keeping the slave open would hide EOF from the reader after exit
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        tracing::info!(pid = ?child.process_id(), "Spawned shell process");

        Ok(SpawnedPty {
            reader,
            writer,
            process: Box::new(NativeProcess {
                master: pair.master,
                child,
            }),
        })
    }
}

struct NativeProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn resize(&mut self, size: TerminalSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .context("Failed to resize PTY")
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("Failed to kill shell")?;
        // Reap so the process does not linger as a zombie
        let _ = self.child.wait();
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.exit_code() as i32))
    }
}
