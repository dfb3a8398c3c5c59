use std::sync::Arc;

use chrono::Utc;
use haat_contracts::{NotificationEvent, ServerEvent};
use haat_kernel::{gate, Principal};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{Room, RoomBroker};
use crate::directory::Directory;

pub const CHAT_KIND: &str = "chat";

#[derive(Serialize)]
struct OutboxRecord<'a> {
    notification_id: &'a str,
    user_id: &'a str,
    kind: &'a str,
    title: &'a str,
    message: &'a str,
    chat_id: &'a str,
    sender_id: &'a str,
    ts: String,
}

pub struct NotificationOutbox {
    file: Mutex<tokio::fs::File>,
}

impl NotificationOutbox {
    pub async fn open(path: &str) -> Result<Self, String> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open notification outbox {path}: {e}"))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    async fn append(&self, event: &NotificationEvent, sender_id: &str) -> Result<(), String> {
        let record = OutboxRecord {
            notification_id: &event.id,
            user_id: &event.user_id,
            kind: &event.kind,
            title: &event.title,
            message: &event.message,
            chat_id: &event.chat_id,
            sender_id,
            ts: event.created_at.to_rfc3339(),
        };
        let mut line = serde_json::to_string(&record).map_err(|e| e.to_string())?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())
    }
}

pub struct Notifier {
    enabled: bool,
    outbox: Option<NotificationOutbox>,
    broker: Arc<RoomBroker>,
    directory: Arc<dyn Directory>,
}

impl Notifier {
    pub async fn new(
        cfg: &haat_config::Notifications,
        broker: Arc<RoomBroker>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self, String> {
        let outbox = match cfg.jsonl_path.as_deref() {
            Some(path) if cfg.enabled && !path.is_empty() => {
                Some(NotificationOutbox::open(path).await?)
            }
            _ => None,
        };
        Ok(Self {
            enabled: cfg.enabled,
            outbox,
            broker,
            directory,
        })
    }

    /// Notifies `recipient` of a new message if they are reachable and their
    /// preferences allow it. Returns whether a notification was emitted.
    pub async fn chat_message(&self, recipient: &str, sender: &Principal, chat_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(target) = self.directory.principal(recipient) else {
            debug!(recipient, "notification target unknown");
            return false;
        };
        if !gate::is_eligible(&target) || !self.directory.notify_prefs(recipient).allows_chat() {
            return false;
        }

        let event = NotificationEvent {
            id: format!("ntf_{}", uuid::Uuid::new_v4().as_simple()),
            user_id: target.id.clone(),
            kind: CHAT_KIND.to_string(),
            title: "New chat message".to_string(),
            message: format!("{} sent you a message", sender.name),
            chat_id: chat_id.to_string(),
            created_at: Utc::now(),
        };

        if let Some(outbox) = &self.outbox {
            if let Err(err) = outbox.append(&event, &sender.id).await {
                warn!(recipient, chat_id, error = %err, "notification outbox write failed");
            }
        }
        self.broker
            .publish(
                &Room::User(target.id.clone()),
                &ServerEvent::Notification(event),
                None,
            )
            .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use haat_config::PrincipalSeed;
    use haat_contracts::Role;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::sync::mpsc;

    fn seed(id: &str, role: Role, notify_chat: bool) -> PrincipalSeed {
        PrincipalSeed {
            id: id.to_string(),
            name: id.to_string(),
            role,
            token: format!("tok-{id}"),
            active: true,
            blocked: false,
            notify_chat,
            notify_in_app: true,
            subscribed_farmers: Vec::new(),
        }
    }

    fn directory() -> Arc<dyn Directory> {
        Arc::new(StaticDirectory::from_config(&haat_config::Directory {
            principals: vec![
                seed("buyer", Role::Buyer, true),
                seed("quiet", Role::Farmer, false),
                seed("loud", Role::Farmer, true),
            ],
            products: Vec::new(),
            orders: Vec::new(),
        }))
    }

    fn sender() -> Principal {
        Principal {
            id: "buyer".to_string(),
            name: "Asha".to_string(),
            role: Role::Buyer,
            active: true,
            blocked: false,
        }
    }

    #[tokio::test]
    async fn respects_preferences_and_writes_outbox() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("haat-outbox-{nanos}.jsonl"));
        let broker = Arc::new(RoomBroker::new());
        let (tx, mut rx) = mpsc::channel(4);
        broker.join(Room::User("loud".to_string()), 1, tx).await;

        let cfg = haat_config::Notifications {
            enabled: true,
            jsonl_path: Some(path.to_string_lossy().to_string()),
        };
        let notifier = Notifier::new(&cfg, broker, directory()).await.unwrap();

        assert!(!notifier.chat_message("quiet", &sender(), "c1").await);
        assert!(notifier.chat_message("loud", &sender(), "c1").await);

        match rx.try_recv().unwrap() {
            ServerEvent::Notification(n) => {
                assert_eq!(n.message, "Asha sent you a message");
                assert_eq!(n.kind, "chat");
            }
            other => panic!("unexpected event {}", other.name()),
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["user_id"], "loud");
        assert_eq!(record["sender_id"], "buyer");
    }

    #[tokio::test]
    async fn disabled_notifier_is_silent() {
        let cfg = haat_config::Notifications {
            enabled: false,
            jsonl_path: None,
        };
        let notifier = Notifier::new(&cfg, Arc::new(RoomBroker::new()), directory())
            .await
            .unwrap();
        assert!(!notifier.chat_message("loud", &sender(), "c1").await);
    }
}
