//! Pseudo-terminal session management

mod backend;
mod buffer;
pub mod memory;
mod registry;

pub use backend::{
    validate_shell_path, NativePtyBackend, PtyBackend, PtyProcess, SpawnRequest, SpawnedPty,
};
pub use buffer::{OutputBuffer, ScreenId};
pub use registry::{
    strip_ansi, ScreenCapture, ScreenSnapshot, ScreenWindow, SessionEvent, SessionHandle,
    SessionRegistry, SESSION_EVENT_CHANNEL_CAPACITY,
};
