// crates/wifi-mac-rs/tests/simulator/mod.rs
pub mod interface;

pub use interface::SimulatedPhy;

use wifi_mac_rs::frame::decode_mpdu;
use wifi_mac_rs::hal::{WifiMacError, ofdm_tx_duration_us};
use wifi_mac_rs::{
    Mac48Address, MacConfig, MacEvent, MacTimer, Packet, Scheduler, TaggedTimers, Timers,
    WifiMac, WifiMacHeader, WifiMode,
};

/// Everything the virtual channel schedules.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// A timer armed by the MAC of `station`.
    Timer { station: usize, timer: MacTimer },
    /// The end of a reception at `station`.
    RxEnd {
        station: usize,
        rx: u64,
        psdu: Vec<u8>,
        mode: WifiMode,
    },
}

impl From<(usize, MacTimer)> for SimEvent {
    fn from((station, timer): (usize, MacTimer)) -> Self {
        SimEvent::Timer { station, timer }
    }
}

/// A frame seen on the air, kept for assertions.
#[derive(Debug, Clone)]
pub struct AirFrame {
    pub from: usize,
    pub start_us: u64,
    pub duration_us: u64,
    pub header: WifiMacHeader,
}

/// Wraps a `WifiMac` and its `SimulatedPhy` for the test harness.
pub struct StationHarness {
    pub mac: WifiMac,
    pub phy: SimulatedPhy,
    /// Everything the MAC reported, in order.
    pub events: Vec<MacEvent>,
}

impl StationHarness {
    pub fn address(&self) -> Mac48Address {
        self.mac.address()
    }

    /// Payloads forwarded up by this station.
    pub fn forwarded(&self) -> Vec<(Mac48Address, Vec<u8>)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                MacEvent::ForwardUp { packet, from, .. } => Some((*from, packet.data().to_vec())),
                _ => None,
            })
            .collect()
    }

    pub fn tx_ok(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, MacEvent::TxOk(_)))
            .count()
    }

    pub fn tx_failed(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, MacEvent::TxFailed(_)))
            .count()
    }
}

/// A single shared 802.11 channel: every station hears every other one,
/// with no propagation delay. Overlapping receptions are all lost.
pub struct VirtualChannel {
    scheduler: Scheduler<SimEvent>,
    pub stations: Vec<StationHarness>,
    /// Trace of all frames sent on the channel.
    pub air: Vec<AirFrame>,
    next_rx: u64,
}

impl VirtualChannel {
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            stations: Vec::new(),
            air: Vec::new(),
            next_rx: 1,
        }
    }

    pub fn current_time(&self) -> u64 {
        self.scheduler.now_us()
    }

    /// Adds a station and returns its index.
    pub fn add_station(&mut self, config: MacConfig) -> usize {
        let index = self.stations.len();
        let timers = TaggedTimers::new(&mut self.scheduler, index);
        let mac = WifiMac::new(config, &timers);
        self.stations.push(StationHarness {
            mac,
            phy: SimulatedPhy::new(),
            events: Vec::new(),
        });
        index
    }

    /// Queues `payload` at `station` for `to`.
    pub fn send(
        &mut self,
        station: usize,
        to: Mac48Address,
        payload: Vec<u8>,
        tid: u8,
    ) -> Result<(), WifiMacError> {
        self.with_station(station, |mac, phy, timers| {
            mac.enqueue(phy, timers, Packet::new(payload), to, tid)
        })
    }

    /// Runs the simulation until no event is left before `limit_us`.
    pub fn run_until(&mut self, limit_us: u64) {
        while let Some((_, event)) = self.scheduler.pop_until(limit_us) {
            match event {
                SimEvent::Timer { station, timer } => {
                    self.with_station(station, |mac, phy, timers| {
                        mac.handle_timer(phy, timers, timer)
                    });
                }
                SimEvent::RxEnd {
                    station,
                    rx,
                    psdu,
                    mode,
                } => self.end_rx(station, rx, &psdu, mode),
            }
        }
    }

    /// Data frames (not control frames) seen on the air.
    pub fn data_frames(&self) -> Vec<&AirFrame> {
        self.air.iter().filter(|f| f.header.is_data()).collect()
    }

    fn with_station<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut WifiMac, &mut SimulatedPhy, &mut dyn Timers) -> R,
    ) -> R {
        let now = self.scheduler.now_us();
        let station = &mut self.stations[index];
        station.phy.now_us = now;
        let result = {
            let mut timers = TaggedTimers::new(&mut self.scheduler, index);
            f(&mut station.mac, &mut station.phy, &mut timers)
        };
        station.events.extend(station.mac.drain_events());
        self.transmit_pending(index);
        result
    }

    /// Puts what `from` handed to its PHY on the air.
    fn transmit_pending(&mut self, from: usize) {
        let now = self.scheduler.now_us();
        let frames = self.stations[from].phy.take_tx_frames();
        for (psdu, mode) in frames {
            let duration = ofdm_tx_duration_us(psdu.len(), mode);
            let phy = &mut self.stations[from].phy;
            phy.tx_end_us = now + duration;
            // Half duplex: whatever we were receiving is lost.
            if phy.rx.is_some() {
                phy.rx_corrupted = true;
            }
            if let Ok((header, _)) = decode_mpdu(&psdu) {
                self.air.push(AirFrame {
                    from,
                    start_us: now,
                    duration_us: duration,
                    header,
                });
            }
            for to in 0..self.stations.len() {
                if to != from {
                    self.start_rx(to, &psdu, mode, duration);
                }
            }
        }
    }

    fn start_rx(&mut self, station: usize, psdu: &[u8], mode: WifiMode, duration: u64) {
        let now = self.scheduler.now_us();
        let harness = &mut self.stations[station];
        harness.phy.now_us = now;
        if harness.phy.is_transmitting() {
            return;
        }
        let timers = TaggedTimers::new(&mut self.scheduler, station);
        if harness.phy.rx.is_some() {
            // Overlap: both signals are lost, the medium stays busy.
            harness.phy.rx_corrupted = true;
            harness.mac.notify_maybe_cca_busy_start(&timers, duration);
            return;
        }
        let rx = self.next_rx;
        self.next_rx += 1;
        harness.phy.rx = Some(rx);
        harness.phy.rx_corrupted = false;
        harness.phy.last_rx_start_us = now;
        harness.mac.notify_rx_start(&timers, duration);
        self.scheduler.schedule_in(
            duration,
            SimEvent::RxEnd {
                station,
                rx,
                psdu: psdu.to_vec(),
                mode,
            },
        );
    }

    fn end_rx(&mut self, station: usize, rx: u64, psdu: &[u8], mode: WifiMode) {
        let phy = &mut self.stations[station].phy;
        if phy.rx != Some(rx) {
            return;
        }
        phy.rx = None;
        let corrupted = phy.rx_corrupted;
        self.with_station(station, |mac, phy, timers| {
            if corrupted {
                mac.receive_error(phy, timers);
            } else {
                mac.receive_ok(phy, timers, psdu, 30.0, mode);
            }
        });
    }
}

/// An ad-hoc station `local(id)` with a distinct backoff seed.
pub fn station_config(id: u16) -> MacConfig {
    let mut config = MacConfig::ofdm_a(Mac48Address::local(id));
    config.rng_seed = 0x5eed_0000 + u64::from(id);
    config
}
