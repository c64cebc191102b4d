/*
    WangMux
    https://github.com/wangmux/wangmux

    Copyright 2025 The WangMux Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    machine.rs

    The emulation driver: owns the scheduler and the MXD card and advances
    both in lockstep. The i8080 is the clocked device; it runs until its
    accumulated virtual time would pass the next timer deadline, then the
    scheduler catches up and fires whatever came due.
*/

use crate::{
    devices::termmux::TermMuxCard,
    scheduler::{timer_ms, Scheduler},
};

/// Safety clamp on a single slice so a stuck or mis-estimated device
/// cannot starve timers indefinitely.
pub const MAX_SLICE_NS: u64 = timer_ms(50);

pub struct Machine {
    scheduler: Scheduler<TermMuxCard>,
    card: TermMuxCard,
}

impl Machine {
    pub fn new(card: TermMuxCard) -> Self {
        Self {
            scheduler: Scheduler::new(),
            card,
        }
    }

    pub fn card(&self) -> &TermMuxCard {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut TermMuxCard {
        &mut self.card
    }

    pub fn now_ns(&self) -> u64 {
        self.scheduler.now_ns()
    }

    /// Soonest pending deadline in milliseconds (rounded up), for the
    /// outer loop's sleep calculation.
    pub fn ms_until_next(&mut self) -> Option<u64> {
        self.scheduler.ms_until_next()
    }

    /// Drain bytes queued by the serial receive threads into the UART
    /// FIFOs. Call between slices.
    pub fn poll_endpoints(&mut self) {
        self.card.poll_endpoints();
    }

    /// Advance the emulation by `total_ns` of virtual time. The clock
    /// follows the instruction stream: each i8080 op advances virtual time
    /// by its cycle cost, and timers that come due fire between
    /// instructions, in deadline order. The slice clamp keeps a single
    /// call from starving the outer loop.
    pub fn run_for(&mut self, total_ns: u64) {
        let mut remaining = total_ns.min(MAX_SLICE_NS);

        while remaining > 0 {
            let step_ns = self.card.exec_one_op(&mut self.scheduler);
            self.scheduler.advance(step_ns, &mut self.card);
            remaining = remaining.saturating_sub(step_ns.max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{IoCard, RecordingSystem},
        devices::termmux::SERIAL_CHAR_DELAY_NS,
        scheduler::timer_us,
        session::TermSession,
        termcfg::TermMuxCfg,
    };
    use crossbeam_channel::bounded;
    use std::sync::{Arc, Mutex};

    fn rom_from(program: &[u8]) -> [u8; 4096] {
        let mut rom = [0u8; 4096];
        rom[..program.len()].copy_from_slice(program);
        rom
    }

    fn machine_with(program: &[u8]) -> (Machine, RecordingSystem) {
        let system = RecordingSystem::new();
        let mut cfg = TermMuxCfg::default();
        cfg.set_num_terminals(1);
        let card = TermMuxCard::with_rom(rom_from(program), 0x00, cfg, Box::new(system.clone()));
        (Machine::new(card), system)
    }

    struct SinkSession {
        bytes: Arc<Mutex<Vec<u8>>>,
        fullness: Arc<Mutex<f32>>,
    }

    impl TermSession for SinkSession {
        fn mxd_to_term(&mut self, byte: u8) {
            self.bytes.lock().unwrap().push(byte);
        }

        fn is_active(&self) -> bool {
            true
        }

        fn description(&self) -> String {
            "Sink".to_string()
        }

        fn tx_fullness(&self) -> f32 {
            *self.fullness.lock().unwrap()
        }
    }

    fn attach_sink(machine: &mut Machine) -> (Arc<Mutex<Vec<u8>>>, Arc<Mutex<f32>>) {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let fullness = Arc::new(Mutex::new(0.0f32));
        let session = SinkSession {
            bytes: Arc::clone(&bytes),
            fullness: Arc::clone(&fullness),
        };
        let (_tx, rx) = bounded::<u8>(16);
        machine.card_mut().attach_session(0, Box::new(session), rx);
        (bytes, fullness)
    }

    /// Diagnostics firmware: wait for an OBS strobe, read the (inverted)
    /// byte, and retransmit it on UART 0.
    #[rustfmt::skip]
    const ECHO_ROM: &[u8] = &[
        0x31, 0x00, 0x2F,       // 0000: LXI  SP, 0x2F00
        0x3E, 0x01,             // 0003: MVI  A, 0x01
        0xD3, 0x05,             // 0005: OUT  0x05      ; select uart 0
        0xDB, 0x01,             // 0007: IN   0x01      ; 2200 status
        0xE6, 0x01,             // 0009: ANI  0x01      ; obs_seen?
        0xCA, 0x07, 0x00,       // 000B: JZ   0x0007
        0xDB, 0x02,             // 000E: IN   0x02      ; !data, clears strobes
        0x2F,                   // 0010: CMA
        0x47,                   // 0011: MOV  B, A
        0xDB, 0x0E,             // 0012: IN   0x0E      ; uart status
        0xE6, 0x01,             // 0014: ANI  0x01      ; tx ready?
        0xCA, 0x12, 0x00,       // 0016: JZ   0x0012
        0x78,                   // 0019: MOV  A, B
        0xD3, 0x06,             // 001A: OUT  0x06      ; transmit
        0xC3, 0x07, 0x00,       // 001C: JMP  0x0007
    ];

    /// Diagnostics firmware: poll the RX-ready lines and forward every
    /// received byte to the 2200 over the IB bus (inverted-sense wire).
    #[rustfmt::skip]
    const RX_FORWARD_ROM: &[u8] = &[
        0x31, 0x00, 0x2F,       // 0000: LXI  SP, 0x2F00
        0x3E, 0x01,             // 0003: MVI  A, 0x01
        0xD3, 0x05,             // 0005: OUT  0x05
        0xDB, 0x04,             // 0007: IN   0x04      ; rx ready poll
        0xE6, 0x01,             // 0009: ANI  0x01
        0xCA, 0x07, 0x00,       // 000B: JZ   0x0007
        0xDB, 0x06,             // 000E: IN   0x06      ; pop fifo
        0x2F,                   // 0010: CMA            ; drive !IB
        0xD3, 0x01,             // 0011: OUT  0x01
        0xC3, 0x07, 0x00,       // 0013: JMP  0x0007
    ];

    /// Diagnostics firmware: spin until the PRIME latch is visible, clear
    /// it with OUT 0, then transmit one byte on UART 0 and halt.
    #[rustfmt::skip]
    const PRIME_ROM: &[u8] = &[
        0xDB, 0x01,             // 0000: IN   0x01
        0xE6, 0x04,             // 0002: ANI  0x04      ; prime_seen?
        0xCA, 0x00, 0x00,       // 0004: JZ   0x0000
        0xD3, 0x00,             // 0007: OUT  0x00      ; clear prime latch
        0x3E, 0x01,             // 0009: MVI  A, 0x01
        0xD3, 0x05,             // 000B: OUT  0x05
        0x3E, 0x55,             // 000D: MVI  A, 0x55
        0xD3, 0x06,             // 000F: OUT  0x06
        0x76,                   // 0011: HLT
    ];

    /// Diagnostics firmware: send two bytes back to back, waiting for the
    /// holding register between them, then halt.
    #[rustfmt::skip]
    const DOUBLE_TX_ROM: &[u8] = &[
        0x31, 0x00, 0x2F,       // 0000: LXI  SP, 0x2F00
        0x3E, 0x01,             // 0003: MVI  A, 0x01
        0xD3, 0x05,             // 0005: OUT  0x05
        0x3E, 0x41,             // 0007: MVI  A, 0x41
        0xD3, 0x06,             // 0009: OUT  0x06      ; first byte
        0xDB, 0x0E,             // 000B: IN   0x0E
        0xE6, 0x01,             // 000D: ANI  0x01
        0xCA, 0x0B, 0x00,       // 000F: JZ   0x000B    ; wait for tx ready
        0x3E, 0x42,             // 0012: MVI  A, 0x42
        0xD3, 0x06,             // 0014: OUT  0x06      ; second byte
        0x76,                   // 0016: HLT
    ];

    #[test]
    fn single_byte_echo() {
        let (mut machine, _sys) = machine_with(ECHO_ROM);
        let (bytes, _) = attach_sink(&mut machine);

        machine.card_mut().select(0x01);
        machine.card_mut().strobe_obs(0x41);
        machine.run_for(timer_ms(5));

        assert_eq!(*bytes.lock().unwrap(), vec![0x41]);
        // the strobe was consumed by the firmware's IN 0x02
        machine.card_mut().strobe_obs(0x42);
        machine.run_for(timer_ms(5));
        assert_eq!(*bytes.lock().unwrap(), vec![0x41, 0x42]);
    }

    #[test]
    fn rx_byte_reaches_cpu_via_ibs() {
        let (mut machine, sys) = machine_with(RX_FORWARD_ROM);

        machine.card_mut().serial_rx_byte(0, 0x42);
        assert!(machine.card().interrupt_pending());

        machine.run_for(timer_ms(1));
        // double inversion: firmware drives !0x42, the card inverts again
        assert_eq!(sys.ibs(), vec![0x42]);
        assert!(!machine.card().interrupt_pending());
    }

    #[test]
    fn prime_handshake_and_subsequent_transmit() {
        let (mut machine, _sys) = machine_with(PRIME_ROM);
        let (bytes, _) = attach_sink(&mut machine);

        // the power-on latch is already set; a warm reset re-asserts it
        assert!(machine.card().prime_seen());
        machine.card_mut().reset(true);
        assert!(machine.card().prime_seen());

        machine.run_for(timer_ms(2));
        assert!(!machine.card().prime_seen());
        // the channel accepted an OUT_UART_DATA right after the handshake
        assert_eq!(*bytes.lock().unwrap(), vec![0x55]);
    }

    #[test]
    fn transmit_is_paced_at_character_time() {
        let (mut machine, _sys) = machine_with(DOUBLE_TX_ROM);
        let (bytes, _) = attach_sink(&mut machine);

        // just under one character time: nothing delivered yet
        machine.run_for(timer_us(500));
        assert!(bytes.lock().unwrap().is_empty());

        machine.run_for(timer_us(100));
        assert_eq!(*bytes.lock().unwrap(), vec![0x41]);

        // the second byte needs a full further character time
        machine.run_for(timer_us(500));
        assert_eq!(*bytes.lock().unwrap(), vec![0x41]);
        machine.run_for(timer_us(100));
        assert_eq!(*bytes.lock().unwrap(), vec![0x41, 0x42]);
    }

    #[test]
    fn transmit_backs_off_while_endpoint_queue_is_full() {
        let (mut machine, _sys) = machine_with(DOUBLE_TX_ROM);
        let (bytes, fullness) = attach_sink(&mut machine);

        *fullness.lock().unwrap() = 0.95;
        machine.run_for(SERIAL_CHAR_DELAY_NS + timer_us(100));
        // held back by backpressure
        assert!(bytes.lock().unwrap().is_empty());

        *fullness.lock().unwrap() = 0.0;
        machine.run_for(timer_us(300));
        assert_eq!(*bytes.lock().unwrap(), vec![0x41]);
    }

    #[test]
    fn dropped_byte_still_frees_holding_register() {
        // no endpoint attached: bytes vanish but the channel keeps moving
        let (mut machine, _sys) = machine_with(DOUBLE_TX_ROM);
        machine.run_for(timer_ms(2));
        let stats = machine.card().uart_stats(0);
        assert_eq!(stats.fifo_size, 0);
        // both transmits completed (firmware reached HLT after the second)
        assert!(machine.card().endpoint_description(0).is_none());
    }
}
