//! Fire-and-forget operator notifications for settlements and critical
//! failures, delivered to Discord and/or Telegram webhooks. Disabled unless
//! credentials are configured. Delivery runs on a dedicated thread with a
//! bounded queue; a full queue drops the notification rather than ever
//! stalling a market loop.

use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

const DEFAULT_TELEMETRY_QUEUE_CAPACITY: usize = 512;
const DEFAULT_TELEMETRY_HTTP_TIMEOUT_MS: u64 = 2_000;

#[derive(Clone, Copy, Debug)]
pub enum TelemetryLevel {
    Info,
    Success,
    Critical,
}

impl TelemetryLevel {
    fn as_str(self) -> &'static str {
        match self {
            TelemetryLevel::Info => "INFO",
            TelemetryLevel::Success => "SUCCESS",
            TelemetryLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Clone, Debug)]
struct Notification {
    level: TelemetryLevel,
    topic: String,
    message: String,
}

impl Notification {
    fn render(&self) -> String {
        format!(
            "veridex [{}] {}: {}",
            self.level.as_str(),
            self.topic,
            self.message
        )
    }
}

#[derive(Clone, Debug)]
struct WebhookTargets {
    discord_webhook_url: Option<String>,
    telegram_bot_token: Option<String>,
    telegram_chat_id: Option<String>,
    timeout: Duration,
}

impl WebhookTargets {
    fn from_env() -> Self {
        let timeout_ms = std::env::var("TELEMETRY_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|v| v.clamp(250, 15_000))
            .unwrap_or(DEFAULT_TELEMETRY_HTTP_TIMEOUT_MS);
        Self {
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn any_configured(&self) -> bool {
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        has(&self.discord_webhook_url)
            || (has(&self.telegram_bot_token) && has(&self.telegram_chat_id))
    }

    fn deliver(&self, client: &reqwest::blocking::Client, notification: &Notification) {
        let text = notification.render();
        if let Some(url) = self.discord_webhook_url.as_deref() {
            let _ = client
                .post(url)
                .json(&serde_json::json!({ "content": text }))
                .send();
        }
        if let (Some(token), Some(chat_id)) = (
            self.telegram_bot_token.as_deref(),
            self.telegram_chat_id.as_deref(),
        ) {
            let _ = client
                .post(format!("https://api.telegram.org/bot{token}/sendMessage"))
                .json(&serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "disable_web_page_preview": true,
                }))
                .send();
        }
    }
}

static TELEMETRY_SENDER: OnceLock<SyncSender<Notification>> = OnceLock::new();
static TELEMETRY_INIT_GUARD: OnceLock<Mutex<()>> = OnceLock::new();

fn queue_capacity() -> usize {
    std::env::var("TELEMETRY_QUEUE_CAPACITY")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .map(|v| v.clamp(64, 16_384))
        .unwrap_or(DEFAULT_TELEMETRY_QUEUE_CAPACITY)
}

fn spawn_worker(targets: WebhookTargets) -> SyncSender<Notification> {
    let (tx, rx) = sync_channel::<Notification>(queue_capacity());
    std::thread::spawn(move || {
        let client = reqwest::blocking::Client::builder()
            .timeout(targets.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        while let Ok(notification) = rx.recv() {
            targets.deliver(&client, &notification);
        }
    });
    tx
}

pub fn init_telemetry() {
    if TELEMETRY_SENDER.get().is_some() {
        return;
    }
    let guard = TELEMETRY_INIT_GUARD.get_or_init(|| Mutex::new(()));
    let _lock = match guard.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    };
    if TELEMETRY_SENDER.get().is_some() {
        return;
    }
    let targets = WebhookTargets::from_env();
    if !targets.any_configured() {
        return;
    }
    let _ = TELEMETRY_SENDER.set(spawn_worker(targets));
}

pub fn emit(level: TelemetryLevel, topic: impl Into<String>, message: impl Into<String>) {
    if TELEMETRY_SENDER.get().is_none() {
        init_telemetry();
    }
    let Some(sender) = TELEMETRY_SENDER.get() else {
        return;
    };
    let notification = Notification {
        level,
        topic: topic.into(),
        message: message.into(),
    };
    match sender.try_send(notification) {
        Ok(_) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
    }
}

pub fn emit_success(topic: impl Into<String>, message: impl Into<String>) {
    emit(TelemetryLevel::Success, topic, message);
}

pub fn emit_critical(topic: impl Into<String>, message: impl Into<String>) {
    emit(TelemetryLevel::Critical, topic, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_level_and_topic() {
        let n = Notification {
            level: TelemetryLevel::Critical,
            topic: "settlement".into(),
            message: "task 7 reverted".into(),
        };
        assert_eq!(n.render(), "veridex [CRITICAL] settlement: task 7 reverted");
    }

    #[test]
    fn test_unconfigured_targets_disable_delivery() {
        let targets = WebhookTargets {
            discord_webhook_url: None,
            telegram_bot_token: Some("tok".into()),
            telegram_chat_id: None,
            timeout: Duration::from_millis(100),
        };
        assert!(!targets.any_configured());
    }
}
