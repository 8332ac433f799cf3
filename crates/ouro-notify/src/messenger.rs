//! Outbound messaging with an hourly rate budget, a periodic budget footer
//! and the chat log.

use chrono::Utc;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ouro_core::{
    append_jsonl, BudgetLedger, ChatId, InboundMessage, NotifySettings, StateStore,
    CHAT_LOG_ROTATE_BYTES,
};

use crate::transport::MessageTransport;

const RATE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Dropped by the hourly rate budget.
    RateLimited,
    Failed { reason: String },
}

pub struct Messenger {
    transport: Arc<dyn MessageTransport>,
    store: StateStore,
    ledger: BudgetLedger,
    settings: NotifySettings,
    recent: VecDeque<Instant>,
}

impl Messenger {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        store: StateStore,
        ledger: BudgetLedger,
        settings: NotifySettings,
    ) -> Self {
        Self {
            transport,
            store,
            ledger,
            settings,
            recent: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn MessageTransport> {
        Arc::clone(&self.transport)
    }

    /// Send `text`, subject to the rate budget. Every N-th message carries a
    /// budget footer. Never returns an error; failures are logged.
    pub fn send_with_budget(&mut self, chat_id: ChatId, text: &str) -> SendOutcome {
        if !self.take_rate_slot(Instant::now()) {
            tracing::warn!(
                chat_id,
                limit = self.settings.max_per_hour,
                "outbound message dropped by hourly rate budget"
            );
            return SendOutcome::RateLimited;
        }

        let count = match self.store.update(|doc| doc.messages_sent += 1) {
            Ok(doc) => doc.messages_sent,
            Err(err) => {
                tracing::warn!(error = %err, "failed to bump message counter");
                0
            }
        };
        let every = u64::from(self.settings.budget_report_every);
        let body = if every > 0 && count > 0 && count % every == 0 {
            format!("{text}\n\n---\n{}", self.ledger.summary())
        } else {
            text.to_string()
        };

        let outcome = match self.transport.send(chat_id, &body) {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                tracing::warn!(chat_id, transport = self.transport.name(), error = %err, "send failed");
                SendOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        self.log_chat("out", chat_id, &body, matches!(outcome, SendOutcome::Sent));
        outcome
    }

    pub fn log_inbound(&self, message: &InboundMessage) {
        self.log_chat("in", message.chat_id, &message.text, true);
    }

    fn take_rate_slot(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.settings.max_per_hour as usize {
            return false;
        }
        self.recent.push_back(now);
        true
    }

    fn log_chat(&self, direction: &str, chat_id: ChatId, text: &str, delivered: bool) {
        if let Err(err) = self.store.rotate_chat_log(CHAT_LOG_ROTATE_BYTES) {
            tracing::warn!(error = %err, "chat log rotation failed");
        }
        append_jsonl(
            &self.store.layout().chat_log(),
            &json!({
                "ts": Utc::now().to_rfc3339(),
                "direction": direction,
                "chat_id": chat_id,
                "text": text,
                "delivered": delivered,
            }),
        );
    }
}
