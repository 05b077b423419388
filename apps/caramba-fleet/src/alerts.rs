use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use teloxide::prelude::*;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn icon(&self) -> &'static str {
        match self {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Critical => "🚨",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

/// Receives operator notifications. Delivery is fire-and-forget: a failing
/// sink never blocks or fails the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, severity: Severity, message: &str);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(target: "fleet_alerts", "{}", message),
            Severity::Warning => warn!(target: "fleet_alerts", "{}", message),
            Severity::Critical => error!(target: "fleet_alerts", "{}", message),
        }
    }
}

/// Sends alerts to admin chats through the Telegram bot API.
pub struct TelegramAlertSink {
    bot: Bot,
    chat_ids: Vec<i64>,
}

impl TelegramAlertSink {
    pub fn new(token: &str, chat_ids: Vec<i64>) -> Self {
        Self {
            bot: Bot::new(token),
            chat_ids,
        }
    }
}

impl AlertSink for TelegramAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        if self.chat_ids.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, Telegram alert dropped: {}", message);
            return;
        };

        let bot = self.bot.clone();
        let chat_ids = self.chat_ids.clone();
        let text = format!("{} {}", severity.icon(), message);
        handle.spawn(async move {
            for chat_id in chat_ids {
                if let Err(e) = bot.send_message(ChatId(chat_id), text.clone()).await {
                    warn!("Failed to deliver alert to chat {}: {}", chat_id, e);
                }
            }
        });
    }
}

pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

impl AlertSink for FanoutAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        for sink in &self.sinks {
            sink.notify(severity, message);
        }
    }
}

/// Keeps every alert in memory; used by dry runs and tests.
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<(Severity, String)>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(Severity, String)> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.alerts().iter().any(|(_, m)| m.contains(needle))
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.alerts().iter().filter(|(_, m)| m.contains(needle)).count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((severity, message.to_string()));
    }
}
