use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

pub const READ_DEBOUNCE: Duration = Duration::from_millis(220);

/// Coalesces bursts of incoming messages into a single mark-read request.
/// Each `queue` restarts the delay; only the latest chat id is sent.
pub struct ReadReceiptDebouncer {
    tx: UnboundedSender<String>,
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl ReadReceiptDebouncer {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self::with_delay(tx, READ_DEBOUNCE)
    }

    pub fn with_delay(tx: UnboundedSender<String>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            pending: None,
        }
    }

    pub fn queue(&mut self, chat_id: &str) {
        self.cancel();
        let tx = self.tx.clone();
        let delay = self.delay;
        let chat_id = chat_id.to_string();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(chat_id).is_err() {
                debug!("read receipt dropped; receiver closed");
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for ReadReceiptDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_one_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reads = ReadReceiptDebouncer::new(tx);
        reads.queue("c");
        tokio::time::advance(Duration::from_millis(100)).await;
        reads.queue("c");
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap(), "c");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending_request() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut reads = ReadReceiptDebouncer::new(tx);
        reads.queue("c");
        drop(reads);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(rx.recv().await.is_none());
    }
}
