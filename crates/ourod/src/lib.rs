//! Ouroboros supervisor daemon: task queue, worker pool, direct chat agent,
//! event dispatch and the boot sequence.

pub mod bootstrap;
pub mod commands;
pub mod daemon_loop;
pub mod direct_chat;
pub mod error;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod status;
pub mod supervisor;
pub mod watchdog;

pub use bootstrap::*;
pub use commands::*;
pub use daemon_loop::*;
pub use direct_chat::*;
pub use error::*;
pub use pool::*;
pub use queue::*;
pub use status::*;
pub use supervisor::*;
pub use watchdog::*;

#[cfg(test)]
mod tests {
    use super::{ExitReason, SlashCommand, RESTART_EXIT_CODE};

    #[test]
    fn crate_root_reexports_loop_types() {
        assert_eq!(SlashCommand::parse("/status"), Some(SlashCommand::Status));
        let restart = ExitReason::Restart {
            reason: "update".to_string(),
        };
        assert_eq!(restart.exit_code(), RESTART_EXIT_CODE);
    }
}
