use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_PACKET_UID: AtomicU64 = AtomicU64::new(1);

/// An MSDU (or a fragment of one) travelling through the MAC.
///
/// The uid identifies the packet across queue operations: clones and
/// fragments share it, so `WifiMacQueue::remove` can find a packet that was
/// handed out by `peek`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    uid: u64,
    data: Vec<u8>,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Packet {
            uid: NEXT_PACKET_UID.fetch_add(1, Ordering::Relaxed),
            data,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Copies `size` bytes starting at `offset` into a new packet with the same uid.
    /// The range is clipped to the packet.
    pub fn create_fragment(&self, offset: usize, size: usize) -> Packet {
        let start = offset.min(self.data.len());
        let end = offset.saturating_add(size).min(self.data.len());
        Packet {
            uid: self.uid,
            data: self.data[start..end].to_vec(),
        }
    }

    pub fn add_at_end(&mut self, other: &Packet) {
        self.data.extend_from_slice(&other.data);
    }

    pub fn add_padding(&mut self, n: usize) {
        self.data.resize(self.data.len() + n, 0);
    }
}
