//! Scripted SCSI bus for controller and device tests
//!
//! Plays the initiator side of a single selection: delivers a prepared CDB
//! (and optional message-out/data-out bytes) and captures everything the
//! target sends, classified by the phase signals asserted at the time.

use std::collections::VecDeque;

use crate::bus::{BusSignals, ScsiBus, Signal};
use crate::scsi::cdb_length;

#[derive(Default)]
pub struct TestBus {
    signals: u16,
    dat: u8,

    /// CDB delivered in the command phase
    pub cdb: Vec<u8>,
    /// Message-out bytes; ATN reads asserted while this is non-empty
    pub msg_out: VecDeque<u8>,
    /// Bytes the initiator sends in the DATA OUT phase
    pub data_out: VecDeque<u8>,

    /// Captured DATA IN bytes
    pub data_in: Vec<u8>,
    /// Captured status bytes
    pub status: Vec<u8>,
    /// Captured MESSAGE IN bytes
    pub msg_in: Vec<u8>,
}

impl TestBus {
    pub fn new(cdb: &[u8]) -> Self {
        Self {
            cdb: cdb.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_data_out(mut self, data: &[u8]) -> Self {
        self.data_out = data.iter().copied().collect();
        self
    }

    pub fn with_msg_out(mut self, msgs: &[u8]) -> Self {
        self.msg_out = msgs.iter().copied().collect();
        self
    }

    /// Last status byte the target presented
    pub fn last_status(&self) -> Option<u8> {
        self.status.last().copied()
    }
}

impl ScsiBus for TestBus {
    fn acquire(&mut self) -> BusSignals {
        let mut s = BusSignals(self.signals);
        s.set_atn(!self.msg_out.is_empty());
        s
    }

    fn get_signal(&self, signal: Signal) -> bool {
        if signal == Signal::Atn {
            return !self.msg_out.is_empty();
        }
        self.signals & signal.mask() != 0
    }

    fn set_signal(&mut self, signal: Signal, state: bool) {
        if state {
            self.signals |= signal.mask();
        } else {
            self.signals &= !signal.mask();
        }
    }

    fn get_dat(&self) -> u8 {
        self.dat
    }

    fn set_dat(&mut self, data: u8) {
        self.dat = data;
    }

    fn wait_for_selection(&mut self) -> bool {
        true
    }

    fn wait_signal(&mut self, _signal: Signal, _state: bool) -> bool {
        true
    }

    fn command_handshake(&mut self, buf: &mut [u8; 16]) -> usize {
        let Some(len) = cdb_length(self.cdb[0]) else {
            return 0;
        };
        let n = self.cdb.len().min(len);
        buf[..n].copy_from_slice(&self.cdb[..n]);
        n
    }

    fn send_handshake(&mut self, bytes: &[u8], _delay_after: usize) -> usize {
        let signals = BusSignals(self.signals);
        if signals.msg() {
            self.msg_in.extend_from_slice(bytes);
        } else if signals.cd() {
            self.status.extend_from_slice(bytes);
        } else {
            self.data_in.extend_from_slice(bytes);
        }
        bytes.len()
    }

    fn receive_handshake(&mut self, bytes: &mut [u8]) -> usize {
        let signals = BusSignals(self.signals);
        let source = if signals.msg() {
            &mut self.msg_out
        } else {
            &mut self.data_out
        };

        for (i, b) in bytes.iter_mut().enumerate() {
            match source.pop_front() {
                Some(v) => *b = v,
                None => return i,
            }
        }
        bytes.len()
    }

    fn reset(&mut self) {
        self.signals = 0;
        self.dat = 0;
    }
}
