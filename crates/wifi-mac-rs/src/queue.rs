//! Bounded, time-bounded FIFO of outgoing frames.

use crate::frame::{Mac48Address, Packet, WifiMacHeader};
use crate::hal::WifiMacError;
use crate::types::Tid;
use alloc::collections::VecDeque;
use log::trace;

/// Default number of frames a queue holds.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 400;
/// Default lifetime of a queued frame (500 ms).
pub const DEFAULT_MAX_QUEUE_DELAY_US: u64 = 500_000;

/// Which header address a lookup by address compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Addr1,
    Addr2,
    Addr3,
    Addr4,
}

impl AddressType {
    fn of(self, header: &WifiMacHeader) -> Mac48Address {
        match self {
            AddressType::Addr1 => header.addr1,
            AddressType::Addr2 => header.addr2,
            AddressType::Addr3 => header.addr3,
            AddressType::Addr4 => header.addr4,
        }
    }
}

#[derive(Debug, Clone)]
struct Item {
    packet: Packet,
    header: WifiMacHeader,
    tstamp_us: u64,
}

/// Every accessor takes the current time and first discards frames older
/// than the maximum delay, so no caller ever observes a stale entry.
#[derive(Debug, Clone)]
pub struct WifiMacQueue {
    items: VecDeque<Item>,
    max_size: usize,
    max_delay_us: u64,
}

impl WifiMacQueue {
    pub fn new(max_size: usize, max_delay_us: u64) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            max_delay_us,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn set_max_delay(&mut self, max_delay_us: u64) {
        self.max_delay_us = max_delay_us;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_delay_us(&self) -> u64 {
        self.max_delay_us
    }

    fn cleanup(&mut self, now_us: u64) {
        let max_delay_us = self.max_delay_us;
        let before = self.items.len();
        self.items
            .retain(|item| item.tstamp_us.saturating_add(max_delay_us) > now_us);
        let purged = before - self.items.len();
        if purged > 0 {
            trace!("Purged {purged} expired frame(s) from queue");
        }
    }

    /// Appends a frame. A full queue drops the new frame (tail drop).
    pub fn enqueue(
        &mut self,
        packet: Packet,
        header: WifiMacHeader,
        now_us: u64,
    ) -> Result<(), WifiMacError> {
        self.cleanup(now_us);
        if self.items.len() >= self.max_size {
            return Err(WifiMacError::QueueFull);
        }
        self.items.push_back(Item {
            packet,
            header,
            tstamp_us: now_us,
        });
        Ok(())
    }

    /// Puts a frame back at the head of the queue, e.g. when the MAC goes to sleep
    /// with a frame in flight.
    pub fn push_front(
        &mut self,
        packet: Packet,
        header: WifiMacHeader,
        now_us: u64,
    ) -> Result<(), WifiMacError> {
        self.cleanup(now_us);
        if self.items.len() >= self.max_size {
            return Err(WifiMacError::QueueFull);
        }
        self.items.push_front(Item {
            packet,
            header,
            tstamp_us: now_us,
        });
        Ok(())
    }

    pub fn dequeue(&mut self, now_us: u64) -> Option<(Packet, WifiMacHeader)> {
        self.cleanup(now_us);
        self.items.pop_front().map(|item| (item.packet, item.header))
    }

    pub fn peek(&mut self, now_us: u64) -> Option<(&Packet, &WifiMacHeader)> {
        self.cleanup(now_us);
        self.items.front().map(|item| (&item.packet, &item.header))
    }

    fn position_by_tid_and_address(
        &self,
        tid: Tid,
        kind: AddressType,
        address: Mac48Address,
    ) -> Option<usize> {
        self.items.iter().position(|item| {
            item.header.is_qos_data()
                && kind.of(&item.header) == address
                && item.header.qos_tid() == tid
        })
    }

    /// First QoS data frame for `tid` whose selected address is `address`.
    /// Returns the frame together with the time it was queued.
    pub fn peek_by_tid_and_address(
        &mut self,
        tid: Tid,
        kind: AddressType,
        address: Mac48Address,
        now_us: u64,
    ) -> Option<(&Packet, &WifiMacHeader, u64)> {
        self.cleanup(now_us);
        let index = self.position_by_tid_and_address(tid, kind, address)?;
        self.items
            .get(index)
            .map(|item| (&item.packet, &item.header, item.tstamp_us))
    }

    pub fn dequeue_by_tid_and_address(
        &mut self,
        tid: Tid,
        kind: AddressType,
        address: Mac48Address,
        now_us: u64,
    ) -> Option<(Packet, WifiMacHeader)> {
        self.cleanup(now_us);
        let index = self.position_by_tid_and_address(tid, kind, address)?;
        self.items
            .remove(index)
            .map(|item| (item.packet, item.header))
    }

    /// Removes the frame carrying `packet`. Returns false if it is not queued.
    pub fn remove(&mut self, packet: &Packet) -> bool {
        match self
            .items
            .iter()
            .position(|item| item.packet.uid() == packet.uid())
        {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn flush(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&mut self, now_us: u64) -> bool {
        self.cleanup(now_us);
        self.items.is_empty()
    }

    pub fn len(&mut self, now_us: u64) -> usize {
        self.cleanup(now_us);
        self.items.len()
    }
}

impl Default for WifiMacQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_QUEUE_DELAY_US)
    }
}
