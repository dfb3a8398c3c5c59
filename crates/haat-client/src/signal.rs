use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use haat_contracts::{ClientEvent, TypingRequest};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

pub const TYPING_IDLE: Duration = Duration::from_millis(1200);

/// Emits `typing:start` once per burst of input and `typing:stop` after the
/// composer has been idle, cleared, sent or switched to another chat.
pub struct TypingSignaler {
    tx: UnboundedSender<ClientEvent>,
    idle: Duration,
    typing: Arc<AtomicBool>,
    chat: Option<String>,
    pending: Option<JoinHandle<()>>,
}

impl TypingSignaler {
    pub fn new(tx: UnboundedSender<ClientEvent>) -> Self {
        Self::with_idle(tx, TYPING_IDLE)
    }

    pub fn with_idle(tx: UnboundedSender<ClientEvent>, idle: Duration) -> Self {
        Self {
            tx,
            idle,
            typing: Arc::new(AtomicBool::new(false)),
            chat: None,
            pending: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing.load(Ordering::SeqCst)
    }

    /// Call on every composer change. Blank input stops immediately.
    pub fn on_input(&mut self, chat_id: &str, text: &str) {
        if self.chat.as_deref() != Some(chat_id) {
            self.stop();
            self.chat = Some(chat_id.to_string());
        }
        if text.trim().is_empty() {
            self.stop();
            return;
        }

        if !self.typing.swap(true, Ordering::SeqCst) {
            self.emit(ClientEvent::TypingStart(TypingRequest {
                chat_id: chat_id.to_string(),
            }));
        }
        self.arm(chat_id.to_string());
    }

    pub fn on_send(&mut self) {
        self.stop();
    }

    /// Cancels the idle timer and emits `typing:stop` if a start is
    /// outstanding.
    pub fn stop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        let Some(chat_id) = self.chat.clone() else {
            return;
        };
        if self.typing.swap(false, Ordering::SeqCst) {
            self.emit(ClientEvent::TypingStop(TypingRequest { chat_id }));
        }
    }

    fn arm(&mut self, chat_id: String) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        let tx = self.tx.clone();
        let typing = Arc::clone(&self.typing);
        let idle = self.idle;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if typing.swap(false, Ordering::SeqCst)
                && tx
                    .send(ClientEvent::TypingStop(TypingRequest { chat_id }))
                    .is_err()
            {
                debug!("live channel gone; idle typing stop dropped");
            }
        }));
    }

    fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).is_err() {
            debug!("live channel gone; typing signal dropped");
        }
    }
}

impl Drop for TypingSignaler {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn start(chat: &str) -> ClientEvent {
        ClientEvent::TypingStart(TypingRequest {
            chat_id: chat.to_string(),
        })
    }

    fn stop(chat: &str) -> ClientEvent {
        ClientEvent::TypingStop(TypingRequest {
            chat_id: chat.to_string(),
        })
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_emits_one_start_and_one_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut signal = TypingSignaler::new(tx);

        signal.on_input("c", "h");
        tokio::time::advance(Duration::from_millis(500)).await;
        signal.on_input("c", "he");
        tokio::time::advance(Duration::from_millis(500)).await;
        signal.on_input("c", "hel");
        assert_eq!(rx.try_recv().unwrap(), start("c"));
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(1100)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap(), stop("c"));
        assert!(!signal.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_input_stops_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut signal = TypingSignaler::new(tx);
        signal.on_input("c", "hi");
        signal.on_input("c", "   ");
        assert_eq!(rx.try_recv().unwrap(), start("c"));
        assert_eq!(rx.try_recv().unwrap(), stop("c"));

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_chat_stops_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut signal = TypingSignaler::new(tx);
        signal.on_input("c", "hi");
        signal.on_input("d", "yo");
        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(got, vec![start("c"), stop("c"), start("d")]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_typing_emits_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut signal = TypingSignaler::new(tx);
        signal.on_send();
        signal.on_input("c", "ok");
        signal.on_send();
        signal.on_send();
        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(got, vec![start("c"), stop("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stop_survives_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut signal = TypingSignaler::new(tx);
        signal.on_input("c", "hi");
        drop(rx);

        tokio::time::advance(TYPING_IDLE).await;
        settle().await;
        assert!(!signal.is_typing());
        signal.on_send();
    }
}
