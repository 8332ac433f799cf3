use ouro_core::TaskId;

/// Operator slash commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Panic,
    Restart,
    Status,
    Cancel(Option<TaskId>),
    Review,
    /// `None` when the argument was missing or not `on`/`off`.
    Evolve(Option<bool>),
    Promote,
    Unknown(String),
}

impl SlashCommand {
    /// `None` for ordinary chat text. Accepts the `/cmd@BotName` form.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed.split_whitespace();
        let head = parts.next()?;
        let name = head[1..].split('@').next().unwrap_or_default().to_lowercase();
        let arg = parts.next();
        Some(match name.as_str() {
            "panic" => SlashCommand::Panic,
            "restart" => SlashCommand::Restart,
            "status" => SlashCommand::Status,
            "cancel" => SlashCommand::Cancel(arg.map(TaskId::new)),
            "review" => SlashCommand::Review,
            "evolve" => SlashCommand::Evolve(match arg.map(str::to_lowercase).as_deref() {
                Some("on") | Some("1") | Some("true") => Some(true),
                Some("off") | Some("0") | Some("false") => Some(false),
                _ => None,
            }),
            "promote" => SlashCommand::Promote,
            _ => SlashCommand::Unknown(name),
        })
    }
}

pub const HELP_TEXT: &str = "Commands: /status, /cancel <id>, /review, /evolve on|off, /promote, /restart, /panic";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(SlashCommand::parse("hello there"), None);
        assert_eq!(SlashCommand::parse("  "), None);
    }

    #[test]
    fn parses_commands_with_bot_suffix_and_case() {
        assert_eq!(SlashCommand::parse("/status"), Some(SlashCommand::Status));
        assert_eq!(SlashCommand::parse("/STATUS@ouro_bot"), Some(SlashCommand::Status));
        assert_eq!(SlashCommand::parse(" /panic "), Some(SlashCommand::Panic));
        assert_eq!(SlashCommand::parse("/restart now"), Some(SlashCommand::Restart));
        assert_eq!(SlashCommand::parse("/promote"), Some(SlashCommand::Promote));
        assert_eq!(SlashCommand::parse("/review"), Some(SlashCommand::Review));
    }

    #[test]
    fn cancel_takes_a_task_id() {
        assert_eq!(
            SlashCommand::parse("/cancel ab12cd34"),
            Some(SlashCommand::Cancel(Some(TaskId::new("ab12cd34"))))
        );
        assert_eq!(SlashCommand::parse("/cancel"), Some(SlashCommand::Cancel(None)));
    }

    #[test]
    fn evolve_accepts_on_and_off() {
        assert_eq!(SlashCommand::parse("/evolve on"), Some(SlashCommand::Evolve(Some(true))));
        assert_eq!(SlashCommand::parse("/evolve OFF"), Some(SlashCommand::Evolve(Some(false))));
        assert_eq!(SlashCommand::parse("/evolve maybe"), Some(SlashCommand::Evolve(None)));
    }

    #[test]
    fn unknown_commands_keep_their_name() {
        assert_eq!(
            SlashCommand::parse("/deploy prod"),
            Some(SlashCommand::Unknown("deploy".to_string()))
        );
    }
}
