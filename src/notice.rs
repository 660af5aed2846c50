//! Transient user notices.
//!
//! At most one notice is shown at a time. Posting replaces the current one
//! and schedules its expiry; an expiry only clears the notice it was
//! scheduled for, so a newer notice is never cut short.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::NoticeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Sequence number, unique per board.
    pub seq: u64,
    pub kind: NoticeKind,
    pub text: String,
    pub ttl: Duration,
}

/// Single-slot notice display shared by a controller and its observers.
#[derive(Clone)]
pub struct NoticeBoard {
    config: NoticeConfig,
    slot: Arc<watch::Sender<Option<Notice>>>,
    next_seq: Arc<AtomicU64>,
}

impl NoticeBoard {
    #[must_use]
    pub fn new(config: NoticeConfig) -> Self {
        let (slot, _) = watch::channel(None);
        Self { config, slot: Arc::new(slot), next_seq: Arc::new(AtomicU64::new(1)) }
    }

    /// Show a success notice for the configured success TTL.
    pub fn success(&self, text: impl Into<String>) -> Notice {
        self.post(NoticeKind::Success, text.into(), self.config.success_ttl)
    }

    /// Show an error notice for the configured error TTL.
    pub fn error(&self, text: impl Into<String>) -> Notice {
        self.post(NoticeKind::Error, text.into(), self.config.error_ttl)
    }

    #[must_use]
    pub fn current(&self) -> Option<Notice> {
        self.slot.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Notice>> {
        self.slot.subscribe()
    }

    /// Remove the current notice without waiting for it to expire.
    pub fn dismiss(&self) {
        self.slot.send_replace(None);
    }

    fn post(&self, kind: NoticeKind, text: String, ttl: Duration) -> Notice {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let notice = Notice { seq, kind, text, ttl };
        match kind {
            NoticeKind::Success => tracing::info!(seq, text = %notice.text, "notice"),
            NoticeKind::Error => tracing::warn!(seq, text = %notice.text, "notice"),
        }
        self.slot.send_replace(Some(notice.clone()));

        let slot = Arc::downgrade(&self.slot);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(slot) = slot.upgrade() {
                slot.send_if_modified(|shown| {
                    let expired = shown.as_ref().is_some_and(|n| n.seq == seq);
                    if expired {
                        *shown = None;
                    }
                    expired
                });
            }
        });
        notice
    }
}

#[cfg(test)]
#[path = "notice_test.rs"]
mod tests;
