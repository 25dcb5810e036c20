mod cvar;
mod queue;

use bitflags::bitflags;

pub use cvar::{CvarRegistry, CvarValue};
pub use queue::{ConsoleCommandQueue, ConsoleQueueSender};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConsoleFlags: u32 {
        /// Never sent to other peers.
        const DONT_REPLICATE = 1 << 0;
        /// Clients may run it on the host.
        const ALLOW_CLIENT_SET = 1 << 1;
        const READ_ONLY = 1 << 2;
    }
}

impl ConsoleFlags {
    pub const NONE: ConsoleFlags = ConsoleFlags::empty();
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("'{0}' may not be set from here")]
    PermissionDenied(String),
    #[error("'{value}' is not a valid value for {name}")]
    InvalidValue { name: String, value: String },
    #[error("{0} is read-only")]
    ReadOnly(String),
    #[error("{name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Command interpreter the session core executes and queries cvars through.
pub trait Console: Send {
    /// Runs `"<name> [args...]"`. The target must carry every flag in
    /// `required`. Returns the target's flags.
    fn perform_command(
        &mut self,
        command: &str,
        required: ConsoleFlags,
    ) -> Result<ConsoleFlags, ConsoleError>;

    fn cvar(&self, name: &str) -> Option<CvarValue>;

    fn flags(&self, name: &str) -> Option<ConsoleFlags>;
}

/// First whitespace-separated token of a command line.
pub fn command_name(command: &str) -> Option<&str> {
    command.split_whitespace().next()
}
