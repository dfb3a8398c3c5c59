use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use haat_contracts::{ClientEvent, ServerEvent, TypingEvent};
use haat_kernel::Principal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth;
use crate::broker::{ConnectionId, Room};
use crate::error::ChatError;
use crate::service::ChatService;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Authenticating,
    Authenticated,
    Disconnected,
}

pub struct LiveSession {
    id: ConnectionId,
    phase: Phase,
    principal: Option<Principal>,
    joined: HashSet<String>,
    tx: mpsc::Sender<ServerEvent>,
    chat: Arc<ChatService>,
}

impl LiveSession {
    pub fn new(chat: Arc<ChatService>, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: chat.broker().next_connection_id(),
            phase: Phase::Connecting,
            principal: None,
            joined: HashSet::new(),
            tx,
            chat,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn joined(&self) -> impl Iterator<Item = &str> {
        self.joined.iter().map(String::as_str)
    }

    /// Moves a connecting session to `Authenticated` and subscribes it to its
    /// personal room. Any failure ends the session.
    pub async fn authenticate(&mut self, token: Option<String>) -> Result<(), ChatError> {
        if self.phase != Phase::Connecting {
            return Err(ChatError::Unauthorized("session already authenticated".to_string()));
        }
        self.phase = Phase::Authenticating;
        match auth::authenticate(self.chat.directory().as_ref(), token) {
            Ok(principal) => {
                self.chat
                    .broker()
                    .join(Room::User(principal.id.clone()), self.id, self.tx.clone())
                    .await;
                info!(conn = self.id, principal = %principal.id, "live session authenticated");
                self.principal = Some(principal);
                self.phase = Phase::Authenticated;
                Ok(())
            }
            Err(err) => {
                self.phase = Phase::Disconnected;
                Err(err)
            }
        }
    }

    /// Parses one text frame. Malformed frames are logged and ignored.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle(event).await,
            Err(err) => warn!(conn = self.id, error = %err, "unparseable live frame"),
        }
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        if self.phase != Phase::Authenticated {
            return;
        }
        let Some(principal_id) = self.principal.as_ref().map(|p| p.id.clone()) else {
            return;
        };
        match event {
            ClientEvent::JoinChat(chat_id) => {
                if self.chat.can_join(&principal_id, &chat_id).await {
                    self.chat
                        .broker()
                        .join(Room::Chat(chat_id.clone()), self.id, self.tx.clone())
                        .await;
                    self.joined.insert(chat_id);
                } else {
                    debug!(conn = self.id, chat_id, "join refused");
                }
            }
            ClientEvent::LeaveChat(chat_id) => {
                self.chat
                    .broker()
                    .leave(&Room::Chat(chat_id.clone()), self.id)
                    .await;
                self.joined.remove(&chat_id);
            }
            ClientEvent::TypingStart(req) => {
                self.relay_typing(&principal_id, req.chat_id, true).await;
            }
            ClientEvent::TypingStop(req) => {
                self.relay_typing(&principal_id, req.chat_id, false).await;
            }
        }
    }

    async fn relay_typing(&self, principal_id: &str, chat_id: String, started: bool) {
        if !self.joined.contains(&chat_id) {
            return;
        }
        let payload = TypingEvent {
            chat_id: chat_id.clone(),
            user_id: principal_id.to_string(),
            typing_at: Utc::now(),
        };
        let event = if started {
            ServerEvent::TypingStart(payload)
        } else {
            ServerEvent::TypingStop(payload)
        };
        self.chat
            .broker()
            .publish(&Room::Chat(chat_id), &event, Some(self.id))
            .await;
    }

    /// Releases every room subscription.
    pub async fn close(&mut self) {
        if self.phase == Phase::Disconnected {
            return;
        }
        self.chat.broker().leave_all(self.id).await;
        self.joined.clear();
        self.phase = Phase::Disconnected;
        debug!(conn = self.id, "live session closed");
    }
}

/// `GET /v1/live`. Authentication happens before the upgrade, so a bad
/// token never gets a socket.
pub async fn live(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let (tx, rx) = mpsc::channel(state.live.channel_capacity.max(1));
    let mut session = LiveSession::new(Arc::clone(&state.chat), tx);
    if let Err(err) = session
        .authenticate(auth::request_token(&headers, &uri))
        .await
    {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| run(session, rx, socket))
}

async fn run(mut session: LiveSession, mut rx: mpsc::Receiver<ServerEvent>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let conn = session.id();

    let outbound = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(conn, error = %err, "encode live frame failed");
                    continue;
                }
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(conn, error = %err, "live socket error");
                break;
            }
        }
    }

    session.close().await;
    outbound.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RoomBroker;
    use crate::directory::{Directory, StaticDirectory};
    use crate::notify::Notifier;
    use crate::store::{MemoryStore, StoreBackend, StoreLimits};
    use haat_config::{Chat, Notifications, PrincipalSeed};
    use haat_contracts::{OpenChatRequest, Role, ThreadSummary, TypingRequest};

    fn seed(id: &str, role: Role) -> PrincipalSeed {
        PrincipalSeed {
            id: id.to_string(),
            name: id.to_string(),
            role,
            token: format!("tok-{id}"),
            active: true,
            blocked: false,
            notify_chat: false,
            notify_in_app: false,
            subscribed_farmers: Vec::new(),
        }
    }

    async fn service() -> Arc<ChatService> {
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::from_config(
            &haat_config::Directory {
                principals: vec![
                    seed("buyer", Role::Buyer),
                    seed("farmer", Role::Farmer),
                    seed("intruder", Role::Buyer),
                ],
                products: Vec::new(),
                orders: Vec::new(),
            },
        ));
        let broker = Arc::new(RoomBroker::new());
        let notifier = Notifier::new(
            &Notifications {
                enabled: false,
                jsonl_path: None,
            },
            Arc::clone(&broker),
            Arc::clone(&directory),
        )
        .await
        .unwrap();
        let chat = Chat::default();
        Arc::new(ChatService::new(
            chat.clone(),
            StoreBackend::Memory(MemoryStore::new(StoreLimits::from_config(&chat))),
            directory,
            broker,
            Arc::new(notifier),
        ))
    }

    async fn session(
        chat: &Arc<ChatService>,
        token: &str,
    ) -> (LiveSession, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let mut s = LiveSession::new(Arc::clone(chat), tx);
        s.authenticate(Some(token.to_string())).await.unwrap();
        (s, rx)
    }

    async fn open_chat(chat: &ChatService) -> String {
        let buyer = chat.directory().principal("buyer").unwrap();
        chat.create_or_open(
            &buyer,
            OpenChatRequest {
                participant_id: "farmer".to_string(),
                product_id: None,
                initial_message: None,
            },
        )
        .await
        .unwrap()
        .chat_id
    }

    #[tokio::test]
    async fn bad_token_never_authenticates() {
        let chat = service().await;
        let (tx, _rx) = mpsc::channel(1);
        let mut s = LiveSession::new(Arc::clone(&chat), tx);
        let err = s.authenticate(Some("bogus".to_string())).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
        assert_eq!(s.phase(), Phase::Disconnected);

        s.handle(ClientEvent::JoinChat("anything".to_string())).await;
        assert_eq!(s.joined().count(), 0);
    }

    #[tokio::test]
    async fn unauthorized_join_is_silent_and_receives_nothing() {
        let chat = service().await;
        let chat_id = open_chat(&chat).await;
        let (mut intruder, mut intruder_rx) = session(&chat, "tok-intruder").await;
        let (mut buyer, _buyer_rx) = session(&chat, "tok-buyer").await;

        intruder.handle(ClientEvent::JoinChat(chat_id.clone())).await;
        assert_eq!(intruder.joined().count(), 0);
        buyer.handle(ClientEvent::JoinChat(chat_id.clone())).await;

        let sender = chat.directory().principal("buyer").unwrap();
        chat.send_message(&sender, &chat_id, "hello").await.unwrap();
        while let Ok(event) = intruder_rx.try_recv() {
            assert!(!matches!(event, ServerEvent::ChatMessage(_)));
        }
    }

    #[tokio::test]
    async fn typing_requires_join_and_skips_sender() {
        let chat = service().await;
        let chat_id = open_chat(&chat).await;
        let (mut buyer, mut buyer_rx) = session(&chat, "tok-buyer").await;
        let (mut farmer, mut farmer_rx) = session(&chat, "tok-farmer").await;

        let typing = ClientEvent::TypingStart(TypingRequest {
            chat_id: chat_id.clone(),
        });
        buyer.handle(typing.clone()).await;
        assert!(farmer_rx.try_recv().is_err());

        buyer.handle(ClientEvent::JoinChat(chat_id.clone())).await;
        farmer.handle(ClientEvent::JoinChat(chat_id.clone())).await;
        buyer.handle(typing).await;

        match farmer_rx.try_recv().unwrap() {
            ServerEvent::TypingStart(e) => assert_eq!(e.user_id, "buyer"),
            other => panic!("unexpected {}", other.name()),
        }
        assert!(buyer_rx.try_recv().is_err());
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn send_and_read_fan_out_to_rooms() {
        let chat = service().await;
        let chat_id = open_chat(&chat).await;
        let (mut buyer, mut buyer_rx) = session(&chat, "tok-buyer").await;
        let (mut farmer, mut farmer_rx) = session(&chat, "tok-farmer").await;
        buyer.handle(ClientEvent::JoinChat(chat_id.clone())).await;
        farmer.handle(ClientEvent::JoinChat(chat_id.clone())).await;

        let sender = chat.directory().principal("buyer").unwrap();
        chat.send_message(&sender, &chat_id, "tomatoes today?").await.unwrap();

        let got = drain(&mut buyer_rx);
        assert_eq!(got.len(), 2);
        match &got[0] {
            ServerEvent::ChatMessage(e) => {
                assert_eq!(e.chat_id, chat_id);
                assert_eq!(e.message.text, "tomatoes today?");
            }
            other => panic!("unexpected {}", other.name()),
        }
        match &got[1] {
            ServerEvent::ThreadUpdated(t) => {
                assert_eq!(t.chat_id, chat_id);
                assert_eq!(t.unread_count, Some(0));
                assert_eq!(t.last_message_preview.as_deref(), Some("tomatoes today?"));
            }
            other => panic!("unexpected {}", other.name()),
        }

        let got = drain(&mut farmer_rx);
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[0], ServerEvent::ChatMessage(e) if e.message.text == "tomatoes today?"));
        match &got[1] {
            ServerEvent::ThreadUpdated(t) => assert_eq!(t.unread_count, Some(1)),
            other => panic!("unexpected {}", other.name()),
        }

        let reader = chat.directory().principal("farmer").unwrap();
        assert_eq!(chat.mark_read(&reader, &chat_id).await.unwrap(), 0);

        let got = drain(&mut buyer_rx);
        assert_eq!(got.len(), 1);
        match &got[0] {
            ServerEvent::ChatRead(r) => {
                assert_eq!(r.user_id, "farmer");
                assert_eq!(r.unread_count, 0);
            }
            other => panic!("unexpected {}", other.name()),
        }

        let got = drain(&mut farmer_rx);
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[0], ServerEvent::ChatRead(r) if r.user_id == "farmer"));
        assert_eq!(
            got[1],
            ServerEvent::ThreadUpdated(ThreadSummary {
                unread_count: Some(0),
                ..ThreadSummary::new(chat_id.clone())
            })
        );
    }

    #[tokio::test]
    async fn close_releases_rooms() {
        let chat = service().await;
        let chat_id = open_chat(&chat).await;
        let (mut buyer, _rx) = session(&chat, "tok-buyer").await;
        buyer.handle_text(&format!(r#"{{"event":"join:chat","data":"{chat_id}"}}"#)).await;
        assert_eq!(chat.broker().subscriber_count(&Room::Chat(chat_id.clone())).await, 1);

        buyer.handle_text("not json").await;
        buyer.close().await;
        assert_eq!(buyer.phase(), Phase::Disconnected);
        assert_eq!(chat.broker().subscriber_count(&Room::Chat(chat_id)).await, 0);
        assert_eq!(
            chat.broker().subscriber_count(&Room::User("buyer".to_string())).await,
            0
        );
    }
}
