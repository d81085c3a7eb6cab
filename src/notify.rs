//! Notification Fan-out. Ported from `original_source/proxy/notifications.py`:
//! the same four message templates, the same SMTP/push field names, the
//! same per-event allow-list and fire-and-forget dispatch — reimplemented
//! as a polymorphic `Channel` trait instead of Python's duck-typed
//! `NotificationSender` ABC, with delivery off-loaded onto detached tokio
//! tasks instead of daemon threads.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::UsageEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStart,
    ServerStop,
    PlayerJoin,
    PlayerLeave,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::ServerStart => "server_start",
            EventKind::ServerStop => "server_stop",
            EventKind::PlayerJoin => "player_join",
            EventKind::PlayerLeave => "player_leave",
        }
    }
}

/// The four templates from the Python `MESSAGE_TEMPLATES` dict, verbatim.
fn template(kind: EventKind) -> (&'static str, &'static str) {
    match kind {
        EventKind::ServerStart => ("[MC] Server Started: {name}", "Server \"{name}\" on port {port} started"),
        EventKind::ServerStop => ("[MC] Server Stopped: {name}", "Server \"{name}\" stopped. Reason: {reason}"),
        EventKind::PlayerJoin => ("[MC] Player Joined: {player}", "{player} joined \"{name}\". Online: {count}"),
        EventKind::PlayerLeave => ("[MC] Player Left: {player}", "{player} left \"{name}\". Online: {count}"),
    }
}

/// Substitute `{name}`/`{port}`/`{player}`/`{count}`/`{reason}` placeholders.
/// A missing key leaves the placeholder untouched rather than panicking —
/// notification delivery is best-effort and must never take the calling
/// connection down with it.
fn render(fmt: &str, params: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut key = String::new();
            let mut closed = false;
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    closed = true;
                    break;
                }
                key.push(c2);
            }
            if closed {
                if let Some(value) = params.get(key.as_str()) {
                    out.push_str(value);
                    continue;
                }
            }
            out.push('{');
            out.push_str(&key);
            if closed {
                out.push('}');
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn event_params(event: &UsageEvent) -> (EventKind, HashMap<&'static str, String>) {
    let mut p = HashMap::new();
    match event {
        UsageEvent::ServerStart { external_port, server_name } => {
            p.insert("name", server_name.clone());
            p.insert("port", external_port.to_string());
            (EventKind::ServerStart, p)
        }
        UsageEvent::ServerStop { external_port, server_name, reason } => {
            p.insert("name", server_name.clone());
            p.insert("port", external_port.to_string());
            p.insert("reason", reason.clone());
            (EventKind::ServerStop, p)
        }
        UsageEvent::PlayerJoin { server_name, player_name, active_count, .. } => {
            p.insert("name", server_name.clone());
            p.insert("player", player_name.clone());
            p.insert("count", active_count.to_string());
            (EventKind::PlayerJoin, p)
        }
        UsageEvent::PlayerLeave { server_name, player_name, active_count, .. } => {
            p.insert("name", server_name.clone());
            p.insert("player", player_name.clone());
            p.insert("count", active_count.to_string());
            (EventKind::PlayerLeave, p)
        }
        UsageEvent::UnauthorizedLogin { .. } => (EventKind::ServerStart, p), // unreachable: not dispatched
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventAllowList {
    #[serde(default)]
    pub server_start: bool,
    #[serde(default)]
    pub server_stop: bool,
    #[serde(default)]
    pub player_join: bool,
    #[serde(default)]
    pub player_leave: bool,
}

impl EventAllowList {
    fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::ServerStart => self.server_start,
            EventKind::ServerStop => self.server_stop,
            EventKind::PlayerJoin => self.player_join,
            EventKind::PlayerLeave => self.player_leave,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,
    #[serde(default)]
    pub smtp_user: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    #[serde(default)]
    pub events: EventAllowList,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub user_key: String,
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub events: EventAllowList,
}

/// The shared capability every notification channel implements, per
/// spec.md §6: `send` for real delivery, `test` for the admin UI's
/// "verify my config" button (implemented here even though this core never
/// calls it, because the capability contract is shared with that
/// out-of-scope collaborator).
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), String>;
    async fn test(&self) -> Result<(), String>;
    fn allows(&self, kind: EventKind) -> bool;
}

pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        EmailChannel { config }
    }

    fn build_message(&self, subject: &str, body: &str) -> Result<Message, String> {
        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| format!("invalid from_address: {e}"))?;
        let mut builder = Message::builder().from(from).subject(subject);
        for to in &self.config.to_addresses {
            let mailbox: Mailbox = to.parse().map_err(|e| format!("invalid to address {to}: {e}"))?;
            builder = builder.to(mailbox);
        }
        builder
            .body(body.to_string())
            .map_err(|e| format!("failed to build message: {e}"))
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
        let mut builder = if self.config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
                .map_err(|e| format!("SMTP relay setup failed: {e}"))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.smtp_host)
        };
        builder = builder.port(self.config.smtp_port);
        if !self.config.smtp_user.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.smtp_user.clone(),
                self.config.smtp_password.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Channel for EmailChannel {
    async fn send(&self, subject: &str, body: &str) -> Result<(), String> {
        if self.config.smtp_host.is_empty() || self.config.to_addresses.is_empty() {
            return Err("SMTP host or recipients not configured".to_string());
        }
        let message = self.build_message(subject, body)?;
        let transport = self.build_transport()?;
        transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| format!("SMTP send failed: {e}"))
    }

    async fn test(&self) -> Result<(), String> {
        if self.config.smtp_host.is_empty() {
            return Err("SMTP host not configured".to_string());
        }
        if self.config.to_addresses.is_empty() {
            return Err("No recipient addresses configured".to_string());
        }
        if self.config.from_address.is_empty() {
            return Err("From address not configured".to_string());
        }
        self.send(
            "[MC] Test Notification",
            "This is a test notification from the gateway.",
        )
        .await
    }

    fn allows(&self, kind: EventKind) -> bool {
        self.config.events.allows(kind)
    }
}

pub struct PushChannel {
    config: PushConfig,
    client: reqwest::Client,
}

impl PushChannel {
    pub fn new(config: PushConfig) -> Self {
        PushChannel {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, subject: &str, body: &str) -> Result<(), String> {
        let response = self
            .client
            .post(&self.config.endpoint_url)
            .form(&[
                ("token", self.config.app_token.as_str()),
                ("user", self.config.user_key.as_str()),
                ("title", subject),
                ("message", body),
                ("priority", &self.config.priority.to_string()),
            ])
            .send()
            .await
            .map_err(|e| format!("push request failed: {e}"))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("push endpoint returned {}", response.status()))
        }
    }
}

#[async_trait]
impl Channel for PushChannel {
    async fn send(&self, subject: &str, body: &str) -> Result<(), String> {
        if self.config.user_key.is_empty() || self.config.app_token.is_empty() {
            return Err("user_key or app_token not configured".to_string());
        }
        self.post(subject, body).await
    }

    async fn test(&self) -> Result<(), String> {
        if self.config.user_key.is_empty() {
            return Err("User key not configured".to_string());
        }
        if self.config.app_token.is_empty() {
            return Err("App token not configured".to_string());
        }
        self.post("[MC] Test Notification", "This is a test notification from the gateway.")
            .await
    }

    fn allows(&self, kind: EventKind) -> bool {
        self.config.events.allows(kind)
    }
}

/// Dispatch table: builds enabled channels from the registry's
/// `notifications` block and fans each event out to every channel whose
/// allow-list includes it, each delivery on its own detached task
/// (fire-and-forget, at-most-once, per spec.md §4.10).
pub struct NotificationFanout {
    channels: Vec<Arc<dyn Channel>>,
}

impl NotificationFanout {
    pub fn from_config(
        email: Option<EmailConfig>,
        push: Option<PushConfig>,
    ) -> Self {
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
        if let Some(cfg) = email {
            if cfg.enabled {
                channels.push(Arc::new(EmailChannel::new(cfg)));
            }
        }
        if let Some(cfg) = push {
            if cfg.enabled {
                channels.push(Arc::new(PushChannel::new(cfg)));
            }
        }
        NotificationFanout { channels }
    }

    pub fn empty() -> Self {
        NotificationFanout { channels: Vec::new() }
    }

    /// Fire-and-forget delivery for `event`. Spawns one detached task per
    /// enabled, allow-listed channel; failures are logged, never retried.
    pub fn notify(&self, event: &UsageEvent) {
        let (kind, params) = event_params(event);
        let (subject_fmt, body_fmt) = template(kind);
        let subject = render(subject_fmt, &params);
        let body = render(body_fmt, &params);

        for channel in &self.channels {
            if !channel.allows(kind) {
                continue;
            }
            let channel = channel.clone();
            let subject = subject.clone();
            let body = body.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.send(&subject, &body).await {
                    log::warn!("notification delivery failed: {e}");
                }
            });
        }
    }
}

/// Hot-reloadable publication point for the notification dispatch table,
/// mirroring `RegistryLoader`'s `ArcSwap`-backed snapshot (spec.md §4.7 /
/// DESIGN NOTES §9): workers load the current `NotificationFanout` once per
/// event rather than holding a fanout built only at startup, so a reload
/// that changes channel config or per-event allow-lists takes effect on the
/// very next event, per spec.md §4.10 ("Config changes take effect on next
/// reload").
pub struct NotificationHub {
    current: ArcSwap<NotificationFanout>,
}

impl NotificationHub {
    pub fn new(initial: NotificationFanout) -> Self {
        NotificationHub {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Rebuild the dispatch table from a freshly reloaded registry snapshot
    /// and publish it; in-flight deliveries built from the prior table are
    /// unaffected.
    pub fn publish(&self, fanout: NotificationFanout) {
        self.current.store(Arc::new(fanout));
    }

    pub fn load(&self) -> Arc<NotificationFanout> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_template_placeholders() {
        let mut params = HashMap::new();
        params.insert("name", "alpha".to_string());
        params.insert("port", "25565".to_string());
        let out = render("Server \"{name}\" on port {port} started", &params);
        assert_eq!(out, "Server \"alpha\" on port 25565 started");
    }

    #[test]
    fn render_leaves_unknown_placeholder_untouched() {
        let params = HashMap::new();
        let out = render("hello {missing}", &params);
        assert_eq!(out, "hello {missing}");
    }

    #[test]
    fn allow_list_gates_delivery() {
        let list = EventAllowList {
            server_start: true,
            server_stop: false,
            player_join: false,
            player_leave: false,
        };
        assert!(list.allows(EventKind::ServerStart));
        assert!(!list.allows(EventKind::ServerStop));
    }

    #[test]
    fn event_params_extract_expected_fields() {
        let event = UsageEvent::PlayerJoin {
            external_port: 25565,
            server_name: "alpha".into(),
            player_name: "neo".into(),
            active_count: 1,
        };
        let (kind, params) = event_params(&event);
        assert!(matches!(kind, EventKind::PlayerJoin));
        assert_eq!(params.get("player").unwrap(), "neo");
        assert_eq!(params.get("count").unwrap(), "1");
    }

    #[test]
    fn hub_publish_replaces_what_load_returns() {
        let hub = NotificationHub::new(NotificationFanout::empty());
        assert_eq!(hub.load().channels.len(), 0);

        let cfg = PushConfig {
            enabled: true,
            endpoint_url: "https://example.invalid".into(),
            user_key: "u".into(),
            app_token: "t".into(),
            priority: 0,
            events: EventAllowList::default(),
        };
        hub.publish(NotificationFanout::from_config(None, Some(cfg)));
        assert_eq!(hub.load().channels.len(), 1);
    }
}
