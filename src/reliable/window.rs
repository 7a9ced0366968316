//! Send/receive sliding-window slot arrays: a fixed-size ring indexed by
//! `sequence mod window_size`, where each slot tracks its own sequence
//! number independently of its index so retransmitted or stale frames can
//! be told apart from a live occupant.

use std::time::Instant;

/// Sequence-number arithmetic is modulo 2^16 throughout this module.
pub fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

pub fn seq_in_window(seq: u16, base: u16, window_size: u16) -> bool {
    seq_distance(base, seq) < window_size
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence: u16,
    pub data: Vec<u8>,
    pub timestamp: Instant,
    pub retry_count: u32,
    pub acknowledged: bool,
    /// Application payload bytes this packet represents once ACKed, 0 for
    /// control frames (START/END) that carry no transfer data.
    pub payload_len: u64,
}

impl Packet {
    pub fn new(sequence: u16, data: Vec<u8>, payload_len: u64) -> Packet {
        Packet {
            sequence,
            data,
            timestamp: Instant::now(),
            retry_count: 0,
            acknowledged: false,
            payload_len,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    in_use: bool,
    packet: Option<Packet>,
}

impl Default for Slot {
    fn default() -> Slot {
        Slot {
            in_use: false,
            packet: None,
        }
    }
}

/// Sender-side window: tracks unacknowledged outbound packets awaiting ACK.
pub struct SendWindow {
    slots: Vec<Slot>,
    window_size: u16,
    pub base: u16,
    pub next: u16,
}

impl SendWindow {
    pub fn new(window_size: u16) -> SendWindow {
        SendWindow {
            slots: vec![Slot::default(); window_size as usize],
            window_size,
            base: 0,
            next: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        seq_distance(self.base, self.next) >= self.window_size
    }

    fn slot_index(&self, seq: u16) -> usize {
        (seq % self.window_size) as usize
    }

    /// Reserves the next sequence number and returns it. Caller must check
    /// `is_full()` first; this never blocks by itself.
    pub fn allocate(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn insert(&mut self, packet: Packet) {
        let idx = self.slot_index(packet.sequence);
        self.slots[idx] = Slot {
            in_use: true,
            packet: Some(packet),
        };
    }

    pub fn get(&self, seq: u16) -> Option<&Packet> {
        let idx = self.slot_index(seq);
        let slot = &self.slots[idx];
        if slot.in_use {
            slot.packet.as_ref().filter(|p| p.sequence == seq)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, seq: u16) -> Option<&mut Packet> {
        let idx = self.slot_index(seq);
        let slot = &mut self.slots[idx];
        if slot.in_use {
            match &slot.packet {
                Some(p) if p.sequence == seq => slot.packet.as_mut(),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Marks `seq` acknowledged if it's a live slot for that sequence.
    pub fn acknowledge(&mut self, seq: u16) -> bool {
        match self.get_mut(seq) {
            Some(p) => {
                p.acknowledged = true;
                true
            }
            None => false,
        }
    }

    fn free(&mut self, seq: u16) {
        let idx = self.slot_index(seq);
        if self.slots[idx].in_use {
            let matches = self.slots[idx]
                .packet
                .as_ref()
                .map(|p| p.sequence == seq)
                .unwrap_or(false);
            if matches {
                self.slots[idx] = Slot::default();
            }
        }
    }

    /// Advances `base` over any contiguous run of acknowledged slots.
    /// Cumulative semantics for the base; per-slot tracking still allows
    /// selective retransmit below the advancing edge.
    pub fn advance_base(&mut self) -> u16 {
        let mut advanced = 0;
        loop {
            if self.base == self.next {
                break;
            }
            let acked = self
                .get(self.base)
                .map(|p| p.acknowledged)
                .unwrap_or(false);
            if !acked {
                break;
            }
            self.free(self.base);
            self.base = self.base.wrapping_add(1);
            advanced += 1;
        }
        advanced
    }

    /// Forcibly drops the slot at `base` (retry budget exhausted) and
    /// advances past it, continuing over any now-contiguous acked run.
    pub fn force_advance_past_base(&mut self) {
        self.free(self.base);
        self.base = self.base.wrapping_add(1);
        self.advance_base();
    }

    /// All occupied, un-acknowledged slots, used by the retransmission scan.
    pub fn pending(&mut self) -> Vec<&mut Packet> {
        self.slots
            .iter_mut()
            .filter(|s| s.in_use)
            .filter_map(|s| s.packet.as_mut())
            .filter(|p| !p.acknowledged)
            .collect()
    }
}

/// Receiver-side window: buffers out-of-order DATA until the gap fills.
pub struct ReceiveWindow {
    slots: Vec<Slot>,
    window_size: u16,
    pub base: u16,
    pub next: u16,
}

impl ReceiveWindow {
    pub fn new(window_size: u16) -> ReceiveWindow {
        ReceiveWindow {
            slots: vec![Slot::default(); window_size as usize],
            window_size,
            base: 0,
            next: 0,
        }
    }

    fn slot_index(&self, seq: u16) -> usize {
        (seq % self.window_size) as usize
    }

    pub fn in_window(&self, seq: u16) -> bool {
        seq_in_window(seq, self.base, self.window_size)
    }

    /// True if `seq`'s slot already holds a packet with that exact
    /// sequence (a retransmission already buffered).
    pub fn already_has(&self, seq: u16) -> bool {
        let idx = self.slot_index(seq);
        let slot = &self.slots[idx];
        slot.in_use
            && slot
                .packet
                .as_ref()
                .map(|p| p.sequence == seq)
                .unwrap_or(false)
    }

    pub fn insert(&mut self, packet: Packet) {
        let idx = self.slot_index(packet.sequence);
        self.next = std::cmp::max(self.next, packet.sequence.wrapping_add(1));
        self.slots[idx] = Slot {
            in_use: true,
            packet: Some(packet),
        };
    }

    /// Resynchronizes the window to start at `seq` (used on handshake).
    pub fn reset_to(&mut self, seq: u16) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::default();
        }
        self.base = seq;
        self.next = seq;
    }

    /// Drains the contiguous prefix starting at `base`, returning payloads
    /// in order and advancing `base` past them.
    pub fn drain_contiguous(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let idx = self.slot_index(self.base);
            let slot = &mut self.slots[idx];
            let matches = slot
                .packet
                .as_ref()
                .map(|p| p.sequence == self.base)
                .unwrap_or(false);
            if !slot.in_use || !matches {
                break;
            }
            let packet = slot.packet.take().unwrap();
            *slot = Slot::default();
            out.push(packet.data);
            self.base = self.base.wrapping_add(1);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_fills_and_advances() {
        let mut w = SendWindow::new(4);
        for _ in 0..4 {
            let seq = w.allocate();
            w.insert(Packet::new(seq, vec![seq as u8], 1));
        }
        assert!(w.is_full());
        w.acknowledge(0);
        w.acknowledge(1);
        assert_eq!(w.advance_base(), 2);
        assert_eq!(w.base, 2);
        assert!(!w.is_full());
    }

    #[test]
    fn send_window_advance_stops_at_gap() {
        let mut w = SendWindow::new(4);
        for _ in 0..4 {
            let seq = w.allocate();
            w.insert(Packet::new(seq, vec![], 0));
        }
        w.acknowledge(0);
        w.acknowledge(2);
        assert_eq!(w.advance_base(), 1);
        assert_eq!(w.base, 1);
    }

    #[test]
    fn receive_window_buffers_out_of_order_then_drains() {
        let mut r = ReceiveWindow::new(4);
        r.insert(Packet::new(1, vec![1], 1));
        r.insert(Packet::new(0, vec![0], 1));
        let drained = r.drain_contiguous();
        assert_eq!(drained, vec![vec![0], vec![1]]);
        assert_eq!(r.base, 2);
    }

    #[test]
    fn sequence_wraps_around_u16_boundary() {
        assert!(seq_in_window(65535, 65534, 4));
        assert!(seq_in_window(1, 65534, 4));
        assert!(!seq_in_window(4, 65534, 4));
    }
}
