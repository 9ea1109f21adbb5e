/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Per-mailbox pub/sub used by IMAP IDLE and untagged-response delivery.
/// Slow subscribers lose the oldest events (broadcast lag) and are expected
/// to coalesce what they do receive into a single EXISTS/EXPUNGE batch.
#[derive(Default)]
pub struct MailboxBus {
    channels: DashMap<i64, broadcast::Sender<MailboxEvent>>,
}

#[derive(Debug, Clone)]
pub enum MailboxEvent {
    /// New messages appended; receivers re-fetch counts.
    Appended { uids: Vec<u32> },
    FlagsChanged { uids: Vec<u32> },
    Expunged { uids: Vec<u32> },
}

const CHANNEL_CAPACITY: usize = 128;

impl MailboxBus {
    pub fn subscribe(&self, mailbox_id: i64) -> broadcast::Receiver<MailboxEvent> {
        self.channels
            .entry(mailbox_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, mailbox_id: i64, event: MailboxEvent) {
        if let Some(sender) = self.channels.get(&mailbox_id) {
            // Errors only mean there are no live subscribers.
            let _ = sender.send(event);
        }
    }

    /// Drops channels with no remaining subscribers.
    pub fn cleanup(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MailboxBus::default();
        let mut rx = bus.subscribe(42);
        bus.publish(42, MailboxEvent::Appended { uids: vec![7] });
        bus.publish(7, MailboxEvent::Appended { uids: vec![1] });

        match rx.recv().await.unwrap() {
            MailboxEvent::Appended { uids } => assert_eq!(uids, vec![7]),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_drops_idle_channels() {
        let bus = MailboxBus::default();
        {
            let _rx = bus.subscribe(1);
            bus.cleanup();
            assert_eq!(bus.channels.len(), 1);
        }
        bus.cleanup();
        assert!(bus.channels.is_empty());
    }
}
