//! In-process SCSI bus
//!
//! Connects a target instance and an initiator instance (or a test driver)
//! within the same process through a shared signal state. Both endpoints
//! poll the shared state through a condition variable; there is no
//! cycle-accurate timing, only the REQ/ACK ordering real initiators rely on.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::bus::{BusSignals, ScsiBus, Signal, RST_HOLD_US};
use crate::scsi::cdb_length;

/// Timeout for a single REQ/ACK transition
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for one wait-for-selection poll. Short, so the bus loop can
/// observe the daemon shutdown flag between polls.
const SELECTION_TIMEOUT: Duration = Duration::from_millis(100);

/// Extra settle delay inserted by `send_handshake` when requested
const SEND_DELAY: Duration = Duration::from_micros(100);

#[derive(Default)]
struct BusState {
    signals: u16,
    dat: u8,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    cond: Condvar,
}

pub struct InProcessBus {
    shared: Arc<Shared>,

    /// Last `acquire()` snapshot
    signals: BusSignals,
    dat: u8,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            signals: BusSignals(0),
            dat: 0,
        }
    }

    /// Returns a second endpoint sharing the same signal state, for the
    /// other side of the bus (initiator or test driver).
    pub fn endpoint(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            signals: BusSignals(0),
            dat: 0,
        }
    }

    fn wait_signal_timeout(&self, signal: Signal, state: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.state.lock().unwrap();
        loop {
            // A bus reset aborts any pending wait
            if signal != Signal::Rst && guard.signals & Signal::Rst.mask() != 0 {
                return false;
            }
            if (guard.signals & signal.mask() != 0) == state {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .shared
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap()
                .0;
        }
    }

    fn receive_byte(&mut self) -> Option<u8> {
        self.set_signal(Signal::Req, true);
        if !self.wait_signal_timeout(Signal::Ack, true, HANDSHAKE_TIMEOUT) {
            self.set_signal(Signal::Req, false);
            return None;
        }

        let dat = self.shared.state.lock().unwrap().dat;

        self.set_signal(Signal::Req, false);
        if !self.wait_signal_timeout(Signal::Ack, false, HANDSHAKE_TIMEOUT) {
            return None;
        }

        Some(dat)
    }

    fn send_byte(&mut self, value: u8) -> bool {
        self.set_dat(value);

        self.set_signal(Signal::Req, true);
        if !self.wait_signal_timeout(Signal::Ack, true, HANDSHAKE_TIMEOUT) {
            self.set_signal(Signal::Req, false);
            return false;
        }

        self.set_signal(Signal::Req, false);
        self.wait_signal_timeout(Signal::Ack, false, HANDSHAKE_TIMEOUT)
    }
}

impl ScsiBus for InProcessBus {
    fn acquire(&mut self) -> BusSignals {
        let guard = self.shared.state.lock().unwrap();
        self.signals = BusSignals(guard.signals);
        self.dat = guard.dat;
        self.signals
    }

    fn get_signal(&self, signal: Signal) -> bool {
        self.shared.state.lock().unwrap().signals & signal.mask() != 0
    }

    fn set_signal(&mut self, signal: Signal, state: bool) {
        let mut guard = self.shared.state.lock().unwrap();
        if state {
            guard.signals |= signal.mask();
        } else {
            guard.signals &= !signal.mask();
        }
        self.shared.cond.notify_all();
    }

    fn get_dat(&self) -> u8 {
        self.dat
    }

    fn set_dat(&mut self, data: u8) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.dat = data;
        self.shared.cond.notify_all();
    }

    fn wait_for_selection(&mut self) -> bool {
        let deadline = Instant::now() + SELECTION_TIMEOUT;
        loop {
            {
                let guard = self.shared.state.lock().unwrap();
                let sel = guard.signals & Signal::Sel.mask() != 0;
                let bsy = guard.signals & Signal::Bsy.mask() != 0;
                if sel && !bsy {
                    self.signals = BusSignals(guard.signals);
                    self.dat = guard.dat;
                    return true;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let guard = self.shared.state.lock().unwrap();
            drop(
                self.shared
                    .cond
                    .wait_timeout(guard, deadline - now)
                    .unwrap(),
            );
        }
    }

    fn wait_signal(&mut self, signal: Signal, state: bool) -> bool {
        self.wait_signal_timeout(signal, state, HANDSHAKE_TIMEOUT)
    }

    fn command_handshake(&mut self, buf: &mut [u8; 16]) -> usize {
        let Some(mut first) = self.receive_byte() else {
            return 0;
        };

        // ICD host adapters prepend a $1F byte in front of the CDB to tunnel
        // the full SCSI command set over ACSI; skip it and read the actual
        // operation code.
        if first == 0x1F {
            let Some(b) = self.receive_byte() else {
                return 0;
            };
            first = b;
        }

        let Some(count) = cdb_length(first) else {
            log::trace!("Unknown command operation code ${:02x}", first);
            return 0;
        };

        buf[0] = first;
        for i in 1..count {
            let Some(b) = self.receive_byte() else {
                return i;
            };
            buf[i] = b;
        }

        count
    }

    fn send_handshake(&mut self, bytes: &[u8], delay_after: usize) -> usize {
        for (i, b) in bytes.iter().enumerate() {
            if !self.send_byte(*b) {
                return i;
            }
            if delay_after != 0 && i + 1 == delay_after {
                std::thread::sleep(SEND_DELAY);
            }
        }

        bytes.len()
    }

    fn receive_handshake(&mut self, bytes: &mut [u8]) -> usize {
        for i in 0..bytes.len() {
            let Some(b) = self.receive_byte() else {
                return i;
            };
            bytes[i] = b;
        }

        bytes.len()
    }

    fn reset(&mut self) {
        self.set_signal(Signal::Rst, true);
        std::thread::sleep(Duration::from_micros(RST_HOLD_US));

        let mut guard = self.shared.state.lock().unwrap();
        guard.signals = 0;
        guard.dat = 0;
        self.shared.cond.notify_all();
    }
}
