use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use haat_contracts::ServerEvent;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Everyone currently viewing a conversation.
    Chat(String),
    /// Every connection of one principal.
    User(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Chat(id) => write!(f, "chat:{id}"),
            Room::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Default)]
pub struct RoomBroker {
    rooms: Mutex<HashMap<Room, HashMap<ConnectionId, mpsc::Sender<ServerEvent>>>>,
    next_id: AtomicU64,
}

impl RoomBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn join(&self, room: Room, conn: ConnectionId, tx: mpsc::Sender<ServerEvent>) {
        debug!(%room, conn, "join");
        self.rooms.lock().await.entry(room).or_default().insert(conn, tx);
    }

    pub async fn leave(&self, room: &Room, conn: ConnectionId) {
        let mut rooms = self.rooms.lock().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    pub async fn leave_all(&self, conn: ConnectionId) {
        let mut rooms = self.rooms.lock().await;
        rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
    }

    /// Delivers `event` to every subscriber of `room` except `except`.
    /// Returns how many queues accepted it.
    pub async fn publish(
        &self,
        room: &Room,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let mut rooms = self.rooms.lock().await;
        let Some(members) = rooms.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (conn, tx) in members.iter() {
            if Some(*conn) == except {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%room, conn, event = event.name(), "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(*conn),
            }
        }
        for conn in closed {
            members.remove(&conn);
        }
        if members.is_empty() {
            rooms.remove(room);
        }
        delivered
    }

    pub async fn subscriber_count(&self, room: &Room) -> usize {
        self.rooms
            .lock()
            .await
            .get(room)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haat_contracts::{ThreadSummary, TypingEvent};

    fn typing(chat: &str) -> ServerEvent {
        ServerEvent::TypingStart(TypingEvent {
            chat_id: chat.to_string(),
            user_id: "u".to_string(),
            typing_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn publish_skips_excluded_connection() {
        let broker = RoomBroker::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let room = Room::Chat("c".to_string());
        broker.join(room.clone(), 1, tx1).await;
        broker.join(room.clone(), 2, tx2).await;

        assert_eq!(broker.publish(&room, &typing("c"), Some(1)).await, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().name(), "typing:start");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let broker = RoomBroker::new();
        let (tx, mut rx) = mpsc::channel(1);
        let room = Room::User("u".to_string());
        broker.join(room.clone(), 7, tx).await;

        let event = ServerEvent::ThreadUpdated(ThreadSummary::new("c"));
        assert_eq!(broker.publish(&room, &event, None).await, 1);
        assert_eq!(broker.publish(&room, &event, None).await, 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.subscriber_count(&room).await, 1);
    }

    #[tokio::test]
    async fn closed_queue_is_unsubscribed() {
        let broker = RoomBroker::new();
        let (tx, rx) = mpsc::channel(1);
        let room = Room::Chat("c".to_string());
        broker.join(room.clone(), 3, tx).await;
        drop(rx);
        assert_eq!(broker.publish(&room, &typing("c"), None).await, 0);
        assert_eq!(broker.subscriber_count(&room).await, 0);
    }

    #[tokio::test]
    async fn leave_all_releases_every_room() {
        let broker = RoomBroker::new();
        let (tx, _rx) = mpsc::channel(1);
        let chat = Room::Chat("c".to_string());
        let user = Room::User("u".to_string());
        broker.join(chat.clone(), 5, tx.clone()).await;
        broker.join(user.clone(), 5, tx).await;
        broker.leave_all(5).await;
        assert_eq!(broker.subscriber_count(&chat).await, 0);
        assert_eq!(broker.subscriber_count(&user).await, 0);
        assert_eq!(chat.to_string(), "chat:c");
    }
}
