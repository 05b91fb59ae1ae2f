use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Europe::Madrid;
use regex::Regex;
use tokio::sync::RwLock;

use verdia_types::Message;

mod persistence;

pub use persistence::{HistoryPersistence, MongoDataApi, NoopPersistence};

/// Identity shared by all clients that fail device-id validation. An
/// explicit simplification, not a security boundary.
pub const ANONYMOUS_DEVICE: &str = "anonymous";

/// Cached sessions idle longer than this are evicted from memory only; the
/// durable copy is retained.
pub const IDLE_EVICTION: Duration = Duration::from_secs(24 * 60 * 60);

const SESSION_CUTOFF_HOURS: i64 = 6;

fn device_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^dev_[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("device id pattern")
    })
}

/// Validate the widget's anonymous identifier; anything else degrades to
/// the pooled `anonymous` identity instead of failing the request.
pub fn resolve_device_id(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(id) if device_id_pattern().is_match(id) => id.to_string(),
        _ => ANONYMOUS_DEVICE.to_string(),
    }
}

pub fn is_valid_device_id(raw: &str) -> bool {
    device_id_pattern().is_match(raw.trim())
}

/// Session date for an instant: the calendar day in the reference timezone,
/// with the day boundary shifted to 06:00 local so late-night conversations
/// stay in the previous day's session.
pub fn session_date_at(instant: DateTime<Utc>) -> String {
    let local = instant.with_timezone(&Madrid);
    let shifted = local - chrono::Duration::hours(SESSION_CUTOFF_HOURS);
    shifted.format("%Y-%m-%d").to_string()
}

pub fn current_session_date() -> String {
    session_date_at(Utc::now())
}

struct CachedSession {
    session_date: String,
    messages: Vec<Message>,
    last_touched: Instant,
}

/// Per-device conversation history: an in-memory session cache with
/// write-through to the configured persistence backend. Writes are spawned
/// so the HTTP reply never waits on the durable store.
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, CachedSession>>,
    persistence: Arc<dyn HistoryPersistence>,
}

impl ConversationStore {
    pub fn new(persistence: Arc<dyn HistoryPersistence>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    pub fn persistence_configured(&self) -> bool {
        self.persistence.is_configured()
    }

    /// Append a message to the device's current session, creating a fresh
    /// session after the day boundary. Returns the session's messages after
    /// the append.
    pub async fn append(&self, device_id: &str, message: Message) -> Vec<Message> {
        let today = current_session_date();
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .entry(device_id.to_string())
                .or_insert_with(|| CachedSession {
                    session_date: today.clone(),
                    messages: Vec::new(),
                    last_touched: Instant::now(),
                });
            if entry.session_date != today {
                entry.session_date = today.clone();
                entry.messages.clear();
            }
            entry.messages.push(message);
            entry.last_touched = Instant::now();
            entry.messages.clone()
        };

        let persistence = self.persistence.clone();
        let device = device_id.to_string();
        let messages = snapshot.clone();
        tokio::spawn(async move {
            if let Err(error) = persistence.save(&device, &today, &messages).await {
                tracing::warn!(
                    target: "verdia.store",
                    device_id = %device,
                    %error,
                    "durable history write failed"
                );
            }
        });

        snapshot
    }

    /// Today's messages for a device. Falls back to a durable read when the
    /// session is not cached; a read failure degrades to empty history.
    pub async fn load(&self, device_id: &str) -> Vec<Message> {
        let today = current_session_date();
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(device_id) {
                if entry.session_date == today {
                    return entry.messages.clone();
                }
            }
        }

        let restored = match self.persistence.load(device_id, &today).await {
            Ok(messages) => messages.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(
                    target: "verdia.store",
                    device_id = %device_id,
                    %error,
                    "durable history read failed"
                );
                Vec::new()
            }
        };

        if !restored.is_empty() {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                device_id.to_string(),
                CachedSession {
                    session_date: today,
                    messages: restored.clone(),
                    last_touched: Instant::now(),
                },
            );
        }
        restored
    }

    /// Drop the in-memory entry only; durable history is retained.
    pub async fn clear_cache(&self, device_id: &str) {
        self.sessions.write().await.remove(device_id);
    }

    /// Evict sessions idle longer than `window`. Run periodically by the
    /// server.
    pub async fn sweep_idle(&self, window: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_touched.elapsed() <= window);
        before - sessions.len()
    }
}
