use serde::Deserialize;
use std::collections::VecDeque;
use std::process::Command;
use std::sync::Mutex;

use ouro_core::{ChatId, InboundMessage};

use crate::error::NotifyError;

/// Telegram rejects messages above 4096 characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Inbound messages plus the offset to request next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    pub messages: Vec<InboundMessage>,
    pub next_offset: i64,
}

pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, chat_id: ChatId, text: &str) -> Result<(), NotifyError>;
    /// Long-poll for updates at or after `offset`.
    fn poll(&self, offset: i64, timeout_secs: u64) -> Result<PollBatch, NotifyError>;
}

/// Telegram Bot API over `curl`.
#[derive(Clone)]
pub struct TelegramTransport {
    token: String,
    pub api_base: String,
    pub send_timeout_secs: u64,
}

impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("api_base", &self.api_base)
            .field("send_timeout_secs", &self.send_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl TelegramTransport {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: "https://api.telegram.org".to_string(),
            send_timeout_secs: 30,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    fn post_json(
        &self,
        method: &str,
        payload: &serde_json::Value,
        timeout_secs: u64,
    ) -> Result<String, NotifyError> {
        let output = Command::new("curl")
            .arg("-sS")
            .arg("-m")
            .arg(timeout_secs.to_string())
            .arg("-X")
            .arg("POST")
            .arg("-H")
            .arg("Content-Type: application/json")
            .arg("-d")
            .arg(payload.to_string())
            .arg(self.method_url(method))
            .output()
            .map_err(|source| NotifyError::Spawn {
                transport: "telegram",
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NotifyError::RequestFailed {
                transport: "telegram",
                status: output.status.code(),
                message: stderr.replace(&self.token, "***").trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl MessageTransport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send(&self, chat_id: ChatId, text: &str) -> Result<(), NotifyError> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let payload = serde_json::json!({"chat_id": chat_id, "text": chunk});
            let body = self.post_json("sendMessage", &payload, self.send_timeout_secs)?;
            check_api_response(&body)?;
        }
        Ok(())
    }

    fn poll(&self, offset: i64, timeout_secs: u64) -> Result<PollBatch, NotifyError> {
        let payload = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        let body = self.post_json("getUpdates", &payload, timeout_secs + 10)?;
        parse_updates(&body, offset)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    chat: UpdateChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateChat {
    id: ChatId,
}

fn check_api_response(body: &str) -> Result<(), NotifyError> {
    let response: ApiResponse<serde_json::Value> =
        serde_json::from_str(body).map_err(|source| NotifyError::Decode {
            transport: "telegram",
            source,
        })?;
    if response.ok {
        Ok(())
    } else {
        Err(NotifyError::Api {
            transport: "telegram",
            description: response.description.unwrap_or_default(),
        })
    }
}

/// Every update advances the offset; only ones with text become messages.
pub fn parse_updates(body: &str, offset: i64) -> Result<PollBatch, NotifyError> {
    let response: ApiResponse<Vec<Update>> =
        serde_json::from_str(body).map_err(|source| NotifyError::Decode {
            transport: "telegram",
            source,
        })?;
    if !response.ok {
        return Err(NotifyError::Api {
            transport: "telegram",
            description: response.description.unwrap_or_default(),
        });
    }
    let mut batch = PollBatch {
        messages: Vec::new(),
        next_offset: offset,
    };
    for update in response.result.unwrap_or_default() {
        batch.next_offset = batch.next_offset.max(update.update_id + 1);
        let Some(message) = update.message else {
            continue;
        };
        let Some(text) = message.text.or(message.caption) else {
            continue;
        };
        batch.messages.push(InboundMessage {
            update_id: update.update_id,
            chat_id: message.chat.id,
            text,
        });
    }
    Ok(batch)
}

/// Split on char boundaries, preferring the last newline inside each window.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars || max_chars == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());
        if end < chars.len() {
            if let Some(pos) = chars[start..end].iter().rposition(|c| *c == '\n') {
                if pos > 0 {
                    end = start + pos + 1;
                }
            }
        }
        chunks.push(chars[start..end].iter().collect());
        start = end;
    }
    chunks
}

/// In-memory transport for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ChatId, String)>>,
    inbound: Mutex<VecDeque<InboundMessage>>,
    fail_sends: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn push_inbound(&self, message: InboundMessage) {
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.push_back(message);
        }
    }

    pub fn set_fail_sends(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_sends.lock() {
            *flag = fail;
        }
    }
}

impl MessageTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send(&self, chat_id: ChatId, text: &str) -> Result<(), NotifyError> {
        if self.fail_sends.lock().map(|f| *f).unwrap_or(false) {
            return Err(NotifyError::Api {
                transport: "recording",
                description: "send disabled".to_string(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((chat_id, text.to_string()));
        }
        Ok(())
    }

    fn poll(&self, offset: i64, _timeout_secs: u64) -> Result<PollBatch, NotifyError> {
        let mut batch = PollBatch {
            messages: Vec::new(),
            next_offset: offset,
        };
        if let Ok(mut inbound) = self.inbound.lock() {
            while let Some(message) = inbound.pop_front() {
                if message.update_id < offset {
                    continue;
                }
                batch.next_offset = batch.next_offset.max(message.update_id + 1);
                batch.messages.push(message);
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_updates_advances_offset_past_non_text_updates() {
        let body = r#"{"ok":true,"result":[
            {"update_id":10,"message":{"chat":{"id":5},"text":"/status"}},
            {"update_id":11,"message":{"chat":{"id":5},"sticker":{}}},
            {"update_id":12,"edited_message":{"chat":{"id":5},"text":"x"}},
            {"update_id":13,"message":{"chat":{"id":6},"caption":"photo note"}}
        ]}"#;
        let batch = parse_updates(body, 10).expect("parse");
        assert_eq!(batch.next_offset, 14);
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].text, "/status");
        assert_eq!(batch.messages[1].chat_id, 6);
    }

    #[test]
    fn parse_updates_surfaces_api_errors() {
        let err = parse_updates(r#"{"ok":false,"description":"Unauthorized"}"#, 0)
            .expect_err("api error");
        assert!(matches!(err, NotifyError::Api { ref description, .. } if description == "Unauthorized"));
        assert!(matches!(
            parse_updates("<html>", 0),
            Err(NotifyError::Decode { .. })
        ));
    }

    #[test]
    fn empty_result_keeps_offset() {
        let batch = parse_updates(r#"{"ok":true,"result":[]}"#, 42).expect("parse");
        assert_eq!(batch, PollBatch { messages: vec![], next_offset: 42 });
    }

    #[test]
    fn split_message_prefers_newlines_and_respects_limit() {
        let text = format!("{}\n{}", "a".repeat(6), "b".repeat(6));
        let chunks = split_message(&text, 8);
        assert_eq!(chunks, vec!["aaaaaa\n".to_string(), "bbbbbb".to_string()]);
        let long = "x".repeat(20);
        let chunks = split_message(&long, 8);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 8));
        assert_eq!(split_message("short", 8), vec!["short".to_string()]);
    }

    #[test]
    fn telegram_debug_hides_token() {
        let transport = TelegramTransport::new("123:secret");
        assert!(!format!("{transport:?}").contains("secret"));
        assert!(transport.method_url("getMe").ends_with("/bot123:secret/getMe"));
    }

    #[test]
    fn recording_transport_records_and_replays() {
        let transport = RecordingTransport::new();
        transport.send(1, "hello").expect("send");
        assert_eq!(transport.sent(), vec![(1, "hello".to_string())]);
        transport.push_inbound(InboundMessage {
            update_id: 3,
            chat_id: 1,
            text: "hi".to_string(),
        });
        let batch = transport.poll(0, 0).expect("poll");
        assert_eq!(batch.next_offset, 4);
        transport.set_fail_sends(true);
        assert!(transport.send(1, "nope").is_err());
    }
}
