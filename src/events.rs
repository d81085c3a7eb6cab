//! Event Logger: append-only JSON-Lines usage log, rotated daily by local
//! date. File handle is opened lazily per date; writes are serialized by an
//! internal lock. I/O errors are logged and swallowed — a logging failure
//! must never abort a connection.

use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum UsageEvent {
    ServerStart {
        external_port: u16,
        server_name: String,
    },
    ServerStop {
        external_port: u16,
        server_name: String,
        reason: String,
    },
    PlayerJoin {
        external_port: u16,
        server_name: String,
        player_name: String,
        active_count: u32,
    },
    PlayerLeave {
        external_port: u16,
        server_name: String,
        player_name: String,
        active_count: u32,
    },
    #[allow(dead_code)] // reserved per spec.md §3
    UnauthorizedLogin {
        external_port: u16,
        reason: String,
    },
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a UsageEvent,
}

struct OpenLog {
    date: chrono::NaiveDate,
    file: File,
}

/// Serializes writes through a single lock and rotates the underlying file
/// by local date as a pure function of "what day is it" — no cross-file
/// handoff, no long-lived handle spanning a date change.
pub struct EventLogger {
    log_dir: PathBuf,
    open: Mutex<Option<OpenLog>>,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        EventLogger {
            log_dir: log_dir.into(),
            open: Mutex::new(None),
        }
    }

    pub async fn log(&self, event: UsageEvent) {
        if let Err(e) = self.try_log(&event).await {
            log::error!("usage log write failed: {e}");
        }
    }

    async fn try_log(&self, event: &UsageEvent) -> std::io::Result<()> {
        let now = Local::now();
        let record = LogRecord {
            timestamp: now.to_rfc3339(),
            event,
        };
        let mut line = serde_json::to_string(&record).expect("UsageEvent always serializes");
        line.push('\n');

        let mut guard = self.open.lock().await;
        let today = now.date_naive();

        let needs_open = match guard.as_ref() {
            Some(open) => open.date != today,
            None => true,
        };

        if needs_open {
            tokio::fs::create_dir_all(&self.log_dir).await?;
            let path = self.log_dir.join(format!("usage-{}.log", today.format("%Y-%m-%d")));
            let file = OpenOptions::new().create(true).append(true).open(path).await?;
            *guard = Some(OpenLog { date: today, file });
        }

        let open = guard.as_mut().expect("just opened");
        open.file.write_all(line.as_bytes()).await?;
        open.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::new(dir.path());
        logger
            .log(UsageEvent::ServerStart {
                external_port: 25565,
                server_name: "alpha".into(),
            })
            .await;
        logger
            .log(UsageEvent::PlayerJoin {
                external_port: 25565,
                server_name: "alpha".into(),
                player_name: "neo".into(),
                active_count: 1,
            })
            .await;

        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        let path = dir.path().join(format!("usage-{today}.log"));
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_kind"], "server_start");
        assert_eq!(first["external_port"], 25565);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_kind"], "player_join");
        assert_eq!(second["active_count"], 1);
    }

    #[tokio::test]
    async fn lazily_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");
        let logger = EventLogger::new(&log_dir);
        logger
            .log(UsageEvent::ServerStop {
                external_port: 1,
                server_name: "x".into(),
                reason: "idle_timeout".into(),
            })
            .await;
        assert!(log_dir.exists());
    }
}
