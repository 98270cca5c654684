use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use parlor_proto::PeerId;

use crate::transport::ChatChannel;

struct Entry {
    generation: u64,
    channel: Arc<dyn ChatChannel>,
}

/// Peer → data channel map used for "send to all".
///
/// Entries are tagged with the session generation that attached them, so a
/// replaced session tearing down cannot evict its successor's channel.
#[derive(Clone, Default)]
pub struct ChannelLifecycle {
    inner: Arc<RwLock<HashMap<PeerId, Entry>>>,
}

impl ChannelLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, peer: PeerId, generation: u64, channel: Arc<dyn ChatChannel>) {
        self.inner
            .write()
            .insert(peer, Entry { generation, channel });
    }

    pub fn release(&self, peer: PeerId, generation: u64) -> bool {
        let mut map = self.inner.write();
        match map.get(&peer) {
            Some(entry) if entry.generation == generation => {
                map.remove(&peer);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `text` to every channel that is open right now. Channels that are
    /// not open are skipped, nothing is queued. Returns how many accepted it.
    pub async fn send_to_all(&self, text: &str) -> usize {
        let snapshot: Vec<(PeerId, Arc<dyn ChatChannel>)> = self
            .inner
            .read()
            .iter()
            .map(|(peer, entry)| (*peer, entry.channel.clone()))
            .collect();

        let mut delivered = 0;
        for (peer, channel) in snapshot {
            if !channel.is_open() {
                debug!(peer_id = %peer, "skipping channel that is not open");
                continue;
            }
            match channel.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer_id = %peer, error = %e, "send on data channel failed"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::error::PeerError;

    #[derive(Default)]
    struct RecordingChannel {
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn new(open: bool) -> Arc<Self> {
            let channel = Self::default();
            channel.open.store(open, Ordering::SeqCst);
            Arc::new(channel)
        }
    }

    #[async_trait]
    impl ChatChannel for RecordingChannel {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: &str) -> Result<(), PeerError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn fan_out_skips_channels_that_are_not_open() {
        let channels = ChannelLifecycle::new();
        let open = RecordingChannel::new(true);
        let connecting = RecordingChannel::new(false);
        channels.attach(PeerId::new(2), 1, open.clone());
        channels.attach(PeerId::new(3), 2, connecting.clone());

        assert_eq!(channels.send_to_all("hi").await, 1);
        assert_eq!(*open.sent.lock(), vec!["hi".to_string()]);
        assert!(connecting.sent.lock().is_empty());
    }

    #[test_timeout::timeout]
    fn release_ignores_stale_generation() {
        let channels = ChannelLifecycle::new();
        channels.attach(PeerId::new(2), 1, RecordingChannel::new(true));
        channels.attach(PeerId::new(2), 4, RecordingChannel::new(true));

        assert!(!channels.release(PeerId::new(2), 1));
        assert_eq!(channels.len(), 1);
        assert!(channels.release(PeerId::new(2), 4));
        assert!(channels.is_empty());
    }
}
