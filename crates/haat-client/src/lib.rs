pub mod debounce;
pub mod signal;
pub mod state;
pub mod typing;

use haat_contracts::ServerEvent;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub use debounce::{ReadReceiptDebouncer, READ_DEBOUNCE};
pub use signal::{TypingSignaler, TYPING_IDLE};
pub use state::{ChatState, PageMeta};
pub use typing::TypingIndicators;

pub struct PresentationState {
    pub chats: ChatState,
    pub typing: TypingIndicators,
    pub reads: ReadReceiptDebouncer,
}

impl PresentationState {
    /// `mark_read_tx` receives chat ids whose read receipt is due.
    pub fn new(me: impl Into<String>, mark_read_tx: UnboundedSender<String>) -> Self {
        let me = me.into();
        Self {
            chats: ChatState::new(me.clone()),
            typing: TypingIndicators::new(me),
            reads: ReadReceiptDebouncer::new(mark_read_tx),
        }
    }

    pub fn apply_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ChatMessage(payload) => {
                if self.chats.apply_incoming(&payload) {
                    self.reads.queue(&payload.chat_id);
                }
            }
            ServerEvent::ThreadUpdated(update) => self.chats.apply_thread_update(update),
            ServerEvent::ChatRead(read) => self.chats.apply_read(&read),
            ServerEvent::TypingStart(typing) => self.typing.on_start(&typing),
            ServerEvent::TypingStop(typing) => self.typing.on_stop(&typing),
            ServerEvent::Notification(note) => {
                debug!(id = %note.id, chat_id = %note.chat_id, "notification received");
            }
        }
    }

    /// Drops cached state and pending timers, e.g. on sign-out.
    pub fn shutdown(&mut self) {
        self.reads.cancel();
        self.typing.clear();
        self.chats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haat_contracts::{ChatMessage, ChatMessageEvent, SenderRef, ThreadSummary, TypingEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn incoming(chat: &str, id: &str, sender: &str) -> ServerEvent {
        ServerEvent::ChatMessage(ChatMessageEvent {
            chat_id: chat.to_string(),
            message: ChatMessage {
                id: Some(id.to_string()),
                sender: SenderRef::Id(sender.to_string()),
                text: "fresh okra".to_string(),
                read_by: vec![sender.to_string()],
                created_at: Utc::now(),
            },
            thread: ThreadSummary::new(chat),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn messages_in_open_chat_schedule_one_receipt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ui = PresentationState::new("asha", tx);
        ui.chats.set_active_chat(Some("c".to_string()));

        ui.apply_server_event(incoming("c", "m1", "hari"));
        ui.apply_server_event(incoming("c", "m2", "hari"));
        ui.apply_server_event(incoming("d", "m3", "maya"));
        ui.apply_server_event(incoming("c", "m4", "asha"));

        tokio::time::advance(READ_DEBOUNCE).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap(), "c");
        assert!(rx.try_recv().is_err());
        assert_eq!(ui.chats.messages("c").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_events_feed_indicators() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut ui = PresentationState::new("asha", tx);
        let typing = TypingEvent {
            chat_id: "c".to_string(),
            user_id: "hari".to_string(),
            typing_at: Utc::now(),
        };
        ui.apply_server_event(ServerEvent::TypingStart(typing.clone()));
        assert_eq!(ui.typing.typing_in("c"), vec!["hari"]);
        ui.apply_server_event(ServerEvent::TypingStop(typing));
        assert!(ui.typing.typing_in("c").is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        ui.shutdown();
        assert!(ui.chats.threads().is_empty());
    }
}
