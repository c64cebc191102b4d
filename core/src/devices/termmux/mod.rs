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

    devices::termmux/mod.rs

    The 2236 MXD Terminal Mux card: an embedded i8080 with 4 KB EPROM and
    4 KB RAM, four RS-232 UART channels, and the parallel-bus interface to
    the Wang 2200 CPU. The card is emulated at chip level; the real MXD
    firmware runs on the i8080 and implements all the terminal protocol.

    Reverse-engineering references:
    - 2200MVP Maintenance Manual 729-0584-A, section F (MXD schematics)
    - 2236MXE Documentation, 8-83
    - Hand disassembly of the MXD ROM, wang2200.org/2200tech/wang_2236mxd.lst
*/

pub mod uart;

mod eprom;

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};

use crate::{
    bus::{IoCard, System2200},
    cpu_i8080::{Bus, I8080},
    scheduler::{timer_us, Scheduler},
    serial::SerialPort,
    session::TermSession,
    termcfg::{TermMuxCfg, MAX_TERMINALS},
};

use self::uart::{Endpoint, UartChannel, UartStats, RX_FIFO_XON_THRESHOLD};

/// The i8080 runs at 1.78 MHz.
pub const NS_PER_TICK: u64 = 561;

/// Serial character transmission time for terminals at 19200 baud:
/// 11 bits per character (start + 8 data + odd parity + stop).
pub const SERIAL_CHAR_DELAY_NS: u64 = 11 * 1_000_000_000 / 19_200;

/// Capacity of the bounded queue carrying bytes from a receive thread to
/// the emulation thread.
const RX_CHANNEL_CAPACITY: usize = 4096;

// input ports
const IN_UART_TXRDY: u8 = 0x00; // parallel poll of which UARTs have room to transmit
const IN_2200_STATUS: u8 = 0x01; // strobe/select/offset status bits
const IN_OBUS_N: u8 = 0x02; // read !OB bus, clear obs/cbs strobe status
const IN_OBSCBS_ADDR: u8 = 0x03; // [7:5] = address offset at time of obs/cbs strobe
const IN_UART_RXRDY: u8 = 0x04; // parallel poll of which UARTs have received a byte
const IN_UART_DATA: u8 = 0x06;
const IN_UART_STATUS: u8 = 0x0E;

// output ports
const OUT_CLR_PRIME: u8 = 0x00; // clears the reset latch
const OUT_IB_N: u8 = 0x01; // drive !IB1-!IB8, pulse IBS
const OUT_IB9_N: u8 = 0x11; // same, plus drive IB9
const OUT_PRIME: u8 = 0x02; // fires the !PRIME strobe
const OUT_HALT_STEP: u8 = 0x03; // one-shot strobe
const OUT_UART_SEL: u8 = 0x05; // uart chip select, one-hot
const OUT_UART_DATA: u8 = 0x06; // write to selected uart data register
const OUT_RBI: u8 = 0x07; // ready/busy mask; 0=ready, 1=busy; bit n = addr offset n+1
const OUT_UART_CMD: u8 = 0x0E; // write to selected uart command register

/// Everything the firmware can reach through the i8080 bus, plus the
/// 2200-side latches. Split from the CPU so `cpu.exec_one_op(&mut state)`
/// borrow-checks; the four host accessors of the i8080 are the `Bus` impl
/// below.
struct MuxState {
    base_addr: u8,
    rom: [u8; 4096],
    ram: [u8; 4096],

    cfg: TermMuxCfg,
    num_terms: usize,

    selected: bool,
    cpb: bool,
    io_offset: u8,
    prime_seen: bool,
    obs_seen: bool,
    cbs_seen: bool,
    obscbs_offset: u8,
    obscbs_data: u8,
    rbi: u8,
    uart_sel: usize,
    interrupt_pending: bool,

    terms: [UartChannel; MAX_TERMINALS],
    system: Box<dyn System2200>,

    /// Channels whose holding register was loaded during the current
    /// instruction; the character timers are armed once the op retires.
    tx_kick: Vec<usize>,
}

impl MuxState {
    /// Drive the ready/busy output while selected.
    fn update_rbi(&mut self) {
        if self.io_offset == 0 || !self.selected {
            return;
        }

        let busy = ((self.obs_seen || self.cbs_seen) && self.io_offset >= 4)
            || ((self.rbi >> (self.io_offset - 1)) & 1) != 0;

        self.system.set_dev_rdy(!busy);
    }

    /// interrupt_pending <=> at least one RX FIFO is non-empty.
    fn update_interrupt(&mut self) {
        self.interrupt_pending = self.terms[..self.num_terms].iter().any(|t| !t.rx_empty());
    }
}

impl Bus for MuxState {
    fn mem_read(&mut self, addr: u16) -> u8 {
        match addr {
            // 4K eprom
            0x0000..=0x0FFF => self.rom[addr as usize],
            // 4KB ram
            0x2000..=0x2FFF => self.ram[(addr & 0x0FFF) as usize],
            _ => {
                debug_assert!(false, "i8080 read from unmapped address {:04x}", addr);
                log::error!("i8080 read from unmapped address {:04x}", addr);
                0x00
            }
        }
    }

    fn mem_write(&mut self, addr: u16, data: u8) {
        match addr {
            0x2000..=0x2FFF => self.ram[(addr & 0x0FFF) as usize] = data,
            _ => {
                debug_assert!(false, "i8080 write to unmapped address {:04x}", addr);
                log::error!("i8080 write to unmapped address {:04x}", addr);
            }
        }
    }

    fn port_read(&mut self, port: u8) -> u8 {
        let term_num = self.uart_sel;

        match port {
            // the hardware inverts the status
            IN_UART_TXRDY => (0..4).fold(0u8, |acc, n| {
                acc | if self.terms[n].tx_ready() { 0 } else { 1 << n }
            }),

            IN_2200_STATUS => {
                let cpu_waiting = self.selected && !self.cpb;
                (self.obs_seen as u8)
                    | (self.cbs_seen as u8) << 1
                    | (self.prime_seen as u8) << 2
                    | (cpu_waiting as u8) << 3
                    | (self.selected as u8) << 4
                    | self.io_offset << 5
            }

            // the 8080 sees the inverted bus polarity
            IN_OBUS_N => {
                self.obs_seen = false;
                self.cbs_seen = false;
                self.update_rbi();
                !self.obscbs_data
            }

            IN_OBSCBS_ADDR => self.obscbs_offset << 5,

            IN_UART_RXRDY => (0..4).fold(0u8, |acc, n| {
                acc | if self.terms[n].rx_empty() { 0 } else { 1 << n }
            }),

            IN_UART_DATA => {
                let byte = match self.terms[term_num].pop_rx() {
                    Some(byte) => {
                        // draining may release flow control
                        self.terms[term_num].check_flow_control();
                        byte
                    }
                    None => 0x00,
                };
                self.update_interrupt();
                byte
            }

            IN_UART_STATUS => {
                let term = &self.terms[term_num];
                let dsr = term_num < self.num_terms;
                (term.tx_ready() as u8)                // [0] room in the tx holding register
                    | (!term.rx_empty() as u8) << 1    // [1] rx fifo has a byte
                    | (term.tx_empty() as u8) << 2     // [2] tx serializer idle
                    | (dsr as u8) << 7 // [7] data set ready; [6:3] error flags unmodeled
            }

            _ => {
                debug_assert!(false, "i8080 read from unmapped port {:02x}", port);
                log::error!("i8080 read from unmapped port {:02x}", port);
                0x00
            }
        }
    }

    fn port_write(&mut self, port: u8, data: u8) {
        match port {
            OUT_CLR_PRIME => self.prime_seen = false,

            OUT_IB_N => {
                // inverted-sense wire; the firmware supplies !IB
                let byte = !data;
                log::trace!("termmux/{:02x} ib={:02x}", self.base_addr, byte);
                self.system.io_card_cb_ibs(byte as u16);
            }

            OUT_IB9_N => {
                let byte = !data;
                log::trace!("termmux/{:02x} ib={:03x}", self.base_addr, 0x100 | byte as u16);
                self.system.io_card_cb_ibs(0x100 | byte as u16);
            }

            OUT_PRIME => self.system.warm_reset(),

            OUT_HALT_STEP => self.system.halt(),

            OUT_UART_SEL => {
                debug_assert!(
                    matches!(data, 0x00 | 0x01 | 0x02 | 0x04 | 0x08),
                    "uart select is one-hot, got {:02x}",
                    data
                );
                self.uart_sel = match data {
                    0x02 => 1,
                    0x04 => 2,
                    0x08 => 3,
                    _ => 0,
                };
            }

            OUT_UART_DATA => {
                if self.uart_sel < self.num_terms {
                    let term = &mut self.terms[self.uart_sel];
                    if !term.tx_ready {
                        log::warn!(
                            "terminal {} mxd overwrote the uart tx buffer",
                            self.uart_sel + 1
                        );
                    }
                    term.tx_ready = false;
                    term.tx_byte = data;
                    self.tx_kick.push(self.uart_sel);
                }
            }

            OUT_UART_CMD => {
                // Only the 8251 behavior the MXD firmware relies on is
                // modeled; the firmware always programs the same mode, so
                // command writes are ignored.
            }

            OUT_RBI => {
                self.rbi = data;
                self.update_rbi();
            }

            _ => {
                debug_assert!(false, "i8080 write to unmapped port {:02x}", port);
                log::error!("i8080 write to unmapped port {:02x}", port);
            }
        }
    }
}

pub struct TermMuxCard {
    cpu: I8080,
    state: MuxState,
}

impl TermMuxCard {
    /// Card with the production firmware EPROM.
    pub fn new(base_addr: u8, cfg: TermMuxCfg, system: Box<dyn System2200>) -> Self {
        Self::with_rom(eprom::MXD_EPROM, base_addr, cfg, system)
    }

    /// Card with an arbitrary 4 KB firmware image (diagnostics, tests).
    pub fn with_rom(
        rom: [u8; 4096],
        base_addr: u8,
        cfg: TermMuxCfg,
        system: Box<dyn System2200>,
    ) -> Self {
        let num_terms = cfg.num_terminals();

        let mut cpu = I8080::new();
        cpu.reset();

        Self {
            cpu,
            state: MuxState {
                base_addr,
                rom,
                ram: [0; 4096],
                cfg,
                num_terms,
                selected: false,
                cpb: true,
                io_offset: 0,
                // the card powers up with the reset latch set
                prime_seen: true,
                obs_seen: false,
                cbs_seen: false,
                obscbs_offset: 0,
                obscbs_data: 0x00,
                rbi: 0xFF,
                uart_sel: 0,
                interrupt_pending: false,
                terms: Default::default(),
                system,
                tx_kick: Vec::new(),
            },
        }
    }

    pub fn cfg(&self) -> &TermMuxCfg {
        &self.state.cfg
    }

    pub fn set_configuration(&mut self, cfg: TermMuxCfg) {
        self.state.num_terms = cfg.num_terminals();
        self.state.cfg = cfg;
    }

    pub fn num_terminals(&self) -> usize {
        self.state.num_terms
    }

    pub fn interrupt_pending(&self) -> bool {
        self.state.interrupt_pending
    }

    pub fn prime_seen(&self) -> bool {
        self.state.prime_seen
    }

    pub fn uart_stats(&self, term_num: usize) -> UartStats {
        self.state.terms[term_num].stats()
    }

    /// Perform one i8080 instruction; returns elapsed virtual time in
    /// nanoseconds. This is the clocked-device step driven by the machine.
    pub fn exec_one_op(&mut self, sched: &mut Scheduler<TermMuxCard>) -> u64 {
        if self.state.interrupt_pending {
            // vector to 0x0038 (rst 7)
            self.cpu.interrupt(0xFF);
        }

        let ticks = self.cpu.exec_one_op(&mut self.state);

        // Holding registers loaded during the op start their character
        // timers now; virtual time only advances between instructions, so
        // the deferral is unobservable.
        while let Some(term_num) = self.state.tx_kick.pop() {
            self.check_tx_buffer(sched, term_num);
        }

        if ticks > 30 {
            // decoder error state: bill a nominal 4 ticks and carry on
            4 * NS_PER_TICK
        } else {
            ticks as u64 * NS_PER_TICK
        }
    }

    /// Arm the character timer for a loaded holding register. At most one
    /// timer is outstanding per channel.
    fn check_tx_buffer(&mut self, sched: &mut Scheduler<TermMuxCard>, term_num: usize) {
        let term = &self.state.terms[term_num];
        if term.tx_ready || term.tx_tmr.is_some() {
            // nothing to do or the serial channel is in use
            return;
        }

        let byte = term.tx_byte;
        let handle = sched.create_timer(SERIAL_CHAR_DELAY_NS, move |card, sched| {
            card.mxd_to_term(sched, term_num, byte)
        });
        self.state.terms[term_num].tx_tmr = Some(handle);
    }

    /// Character time elapsed: deliver the byte to the endpoint, unless the
    /// endpoint's TX queue is nearly full, in which case back off briefly
    /// so RX responsiveness is not hurt.
    fn mxd_to_term(&mut self, sched: &mut Scheduler<TermMuxCard>, term_num: usize, byte: u8) {
        let term = &mut self.state.terms[term_num];
        term.tx_tmr = None;

        if term.endpoint.is_open() {
            let fullness = term.endpoint.tx_fullness();
            if fullness > 0.90 {
                // 90% => 50us, 95% => 125us, 100% => 200us
                let delay_us = 50 + ((fullness - 0.90) * 1500.0) as u64;
                let handle = sched.create_timer(timer_us(delay_us), move |card, sched| {
                    card.mxd_to_term(sched, term_num, byte)
                });
                term.tx_tmr = Some(handle);
                log::debug!(
                    "terminal {} tx queue {:.0}% full, delaying {}us",
                    term_num,
                    fullness * 100.0,
                    delay_us
                );
                return;
            }
        }

        // Delivered, or dropped when no endpoint is attached. Either way
        // the holding register frees up only now, which is what throttles
        // the firmware to real serial rates.
        term.endpoint.send(byte);
        term.tx_ready = true;

        self.check_tx_buffer(sched, term_num);
    }

    // ---- terminal-side entry points ------------------------------------

    /// A byte from the terminal (receive thread origin, but called on the
    /// emulation thread after the queue hop).
    pub fn serial_rx_byte(&mut self, term_num: usize, byte: u8) {
        let term = &mut self.state.terms[term_num];
        term.enqueue_rx(byte);
        if term.rx_len() <= RX_FIFO_XON_THRESHOLD {
            term.check_flow_control();
        }
        self.state.update_interrupt();
    }

    /// Batch ingest for high-throughput endpoints.
    pub fn serial_rx_data(&mut self, term_num: usize, data: &[u8]) {
        self.state.terms[term_num].enqueue_rx_batch(data);
        self.state.update_interrupt();
    }

    /// A keystroke from a non-serial source. If the channel is bound to a
    /// serial port the physical terminal owns input and the keystroke is
    /// discarded.
    pub fn receive_keystroke(&mut self, term_num: usize, keycode: u8) {
        if self.state.terms[term_num].has_serial_endpoint() {
            return;
        }
        self.serial_rx_byte(term_num, keycode);
    }

    /// Drain bytes queued by the receive threads into the UART FIFOs.
    /// Called by the driver between scheduler slices.
    pub fn poll_endpoints(&mut self) {
        let mut any = false;
        for n in 0..self.state.num_terms {
            any |= self.state.terms[n].pump_rx();
        }
        if any {
            self.state.update_interrupt();
        }
    }

    // ---- endpoint management -------------------------------------------

    /// Bind a host serial port directly to a channel. The port's receive
    /// callback feeds the channel's bounded queue.
    pub fn attach_serial_port(&mut self, term_num: usize, port: Arc<SerialPort>) {
        self.detach_endpoint(term_num);

        let (tx, rx) = bounded::<u8>(RX_CHANNEL_CAPACITY);
        port.set_receive_callback(Some(Arc::new(move |byte| {
            // A full queue means the emulation thread is far behind; the
            // byte is dropped here rather than blocking the device thread.
            let _ = tx.try_send(byte);
        })));

        log::info!(
            "terminal {} connected to {}",
            term_num,
            port.config().describe()
        );
        self.state.terms[term_num].endpoint = Endpoint::Serial { port, rx };
    }

    /// Bind a terminal session to a channel. `rx` carries the bytes the
    /// session's term-to-mxd callback produces.
    pub fn attach_session(
        &mut self,
        term_num: usize,
        session: Box<dyn TermSession>,
        rx: Receiver<u8>,
    ) {
        self.detach_endpoint(term_num);
        log::info!(
            "terminal {} connected to session: {}",
            term_num,
            session.description()
        );
        self.state.terms[term_num].endpoint = Endpoint::Session { session, rx };
    }

    /// Close whatever the channel is bound to: flush pending TX so nothing
    /// spurious reaches the terminal, drop the callback, close the device.
    pub fn detach_endpoint(&mut self, term_num: usize) {
        match std::mem::replace(&mut self.state.terms[term_num].endpoint, Endpoint::None) {
            Endpoint::Serial { port, .. } => {
                port.flush_tx_queue();
                port.set_receive_callback(None);
                port.close();
            }
            Endpoint::Session { session, .. } => {
                log::debug!("terminal {} session disconnected", term_num);
                drop(session);
            }
            Endpoint::None => {}
        }
    }

    pub fn endpoint_description(&self, term_num: usize) -> Option<String> {
        match self.state.terms[term_num].endpoint() {
            Endpoint::Serial { port, .. } => Some(format!("Serial:{}", port.config().port_name)),
            Endpoint::Session { session, .. } => Some(session.description()),
            Endpoint::None => None,
        }
    }

    pub fn endpoint_stats(&self, term_num: usize) -> Option<(u64, u64)> {
        match self.state.terms[term_num].endpoint() {
            Endpoint::Serial { port, .. } => Some((port.rx_byte_count(), port.tx_byte_count())),
            Endpoint::Session { .. } | Endpoint::None => None,
        }
    }

    pub fn is_endpoint_active(&self, term_num: usize) -> bool {
        self.state.terms[term_num].endpoint().is_open()
    }
}

impl IoCard for TermMuxCard {
    // The MXD has its own power-on-reset circuit; all !PRMS does is set a
    // latch the 8080 can sample, cleared via OUT 0. The i8251 reset pin is
    // wired low, and the i8080 itself is not reset either.
    fn reset(&mut self, _hard_reset: bool) {
        self.state.prime_seen = true;
    }

    fn select(&mut self, addr: u8) {
        self.state.io_offset = addr & 7;
        log::trace!(
            "termmux/{:02x} +abs {:02x}",
            self.state.base_addr,
            self.state.base_addr + self.state.io_offset
        );

        // offset 0 is not handled
        if self.state.io_offset == 0 {
            return;
        }
        self.state.selected = true;

        self.state.update_rbi();
    }

    fn deselect(&mut self) {
        log::trace!(
            "termmux/{:02x} -abs {:02x}",
            self.state.base_addr,
            self.state.base_addr + self.state.io_offset
        );
        self.state.system.set_dev_rdy(false);

        self.state.selected = false;
        self.state.cpb = true;
    }

    fn strobe_obs(&mut self, val: u8) {
        log::trace!("termmux/{:02x} obs: byte {:02x}", self.state.base_addr, val);

        // any previous obs or cbs must have been serviced before another
        // arrives; a violation is a bug in the bus driver
        assert!(
            !self.state.obs_seen && !self.state.cbs_seen,
            "OBS strobed while a previous strobe was unconsumed"
        );

        // the hardware latches io_offset again on the strobe edge: the host
        // may re-address the board while a fire-and-forget command is still
        // being processed
        self.state.obs_seen = true;
        self.state.obscbs_offset = self.state.io_offset;
        self.state.obscbs_data = val;

        self.state.update_rbi();
    }

    fn strobe_cbs(&mut self, val: u8) {
        log::trace!("termmux/{:02x} cbs: byte {:02x}", self.state.base_addr, val);

        assert!(
            !self.state.obs_seen && !self.state.cbs_seen,
            "CBS strobed while a previous strobe was unconsumed"
        );

        self.state.cbs_seen = true;
        self.state.obscbs_offset = self.state.io_offset;
        self.state.obscbs_data = val;

        self.state.update_rbi();
    }

    // Wang's trick for signaling the display type: any time the address
    // offset is 5, a gate forces !IB5 low (the byte is or'd with 0x10),
    // telling the boot microcode an 80x24 smart terminal is attached
    // rather than a dumb 64x16 display. Replicated literally.
    fn get_ib(&self) -> u8 {
        if self.state.io_offset == 5 {
            0x10
        } else {
            0x00
        }
    }

    fn set_cpu_busy(&mut self, busy: bool) {
        // except for reset, the ucode only ever clears it; IBS sets it back
        log::trace!(
            "termmux/{:02x} cpb{}",
            self.state.base_addr,
            if busy { '+' } else { '-' }
        );
        self.state.cpb = busy;
    }

    fn addresses(&self) -> Vec<u8> {
        (1..8).map(|n| self.state.base_addr + n).collect()
    }

    fn base_addresses(&self) -> Vec<u8> {
        // Running more than one MXD hangs MVP OS; one card is plenty.
        vec![0x00]
    }

    fn name(&self) -> &'static str {
        "2236 MXD"
    }

    fn description(&self) -> &'static str {
        "Terminal Mux"
    }
}

impl Drop for TermMuxCard {
    fn drop(&mut self) {
        // Flush pending TX so nothing spurious reaches the terminals after
        // exit, then close everything.
        for n in 0..MAX_TERMINALS {
            self.detach_endpoint(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::uart::{RX_FIFO_MAX, RX_FIFO_XOFF_THRESHOLD, RX_FIFO_XON_THRESHOLD, XOFF, XON};
    use super::*;
    use crate::bus::RecordingSystem;
    use std::sync::Mutex;

    fn test_card(num_terms: usize) -> (TermMuxCard, RecordingSystem) {
        let system = RecordingSystem::new();
        let mut cfg = TermMuxCfg::default();
        cfg.set_num_terminals(num_terms);
        let card = TermMuxCard::new(0x00, cfg, Box::new(system.clone()));
        (card, system)
    }

    /// Session endpoint that records everything the MXD sends.
    struct SinkSession {
        bytes: Arc<Mutex<Vec<u8>>>,
        fullness: f32,
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
            self.fullness
        }
    }

    fn attach_sink(card: &mut TermMuxCard, term_num: usize) -> Arc<Mutex<Vec<u8>>> {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let session = SinkSession {
            bytes: Arc::clone(&bytes),
            fullness: 0.0,
        };
        let (_tx, rx) = bounded::<u8>(16);
        card.attach_session(term_num, Box::new(session), rx);
        bytes
    }

    #[test]
    fn rx_fifo_overflow_drops_oldest_and_counts() {
        let (mut card, _sys) = test_card(1);

        // bit 5 is kept set so no byte collides with XON/XOFF
        for i in 0..3000u32 {
            card.serial_rx_byte(0, (i & 0xFF) as u8 | 0x20);
        }

        let stats = card.uart_stats(0);
        assert_eq!(stats.fifo_size, RX_FIFO_MAX);
        assert_eq!(stats.rx_overrun_drops, 952);
        // the oldest surviving byte is from iteration 3000 - 2048 = 952
        assert_eq!(card.state.terms[0].front_rx(), Some(0xB8));
        assert!(card.interrupt_pending());
    }

    #[test]
    fn xon_xoff_never_enter_the_fifo() {
        let (mut card, _sys) = test_card(1);

        card.serial_rx_byte(0, XON);
        card.serial_rx_byte(0, 0x55);
        card.serial_rx_byte(0, XOFF);
        card.serial_rx_byte(0, 0x56);

        let stats = card.uart_stats(0);
        assert_eq!(stats.fifo_size, 2);
        assert_eq!(stats.rx_overrun_drops, 0);
        assert_eq!(card.state.terms[0].pop_rx(), Some(0x55));
        assert_eq!(card.state.terms[0].pop_rx(), Some(0x56));
    }

    #[test]
    fn flow_control_hysteresis() {
        let (mut card, _sys) = test_card(1);
        let sink = attach_sink(&mut card, 0);

        // fill to the XOFF threshold: exactly one XOFF goes out
        for _ in 0..RX_FIFO_XOFF_THRESHOLD + 10 {
            card.serial_rx_byte(0, 0x41);
        }
        assert_eq!(
            sink.lock().unwrap().iter().filter(|&&b| b == XOFF).count(),
            1
        );
        assert!(card.uart_stats(0).xoff_sent);
        assert_eq!(card.uart_stats(0).xoff_sent_count, 1);

        // drain through the firmware's data port until the XON threshold
        while card.uart_stats(0).fifo_size > RX_FIFO_XON_THRESHOLD {
            card.state.port_read(IN_UART_DATA);
        }
        assert_eq!(
            sink.lock().unwrap().iter().filter(|&&b| b == XON).count(),
            1
        );
        assert!(!card.uart_stats(0).xoff_sent);

        // draining to empty sends no further XON
        while card.uart_stats(0).fifo_size > 0 {
            card.state.port_read(IN_UART_DATA);
        }
        assert_eq!(
            sink.lock().unwrap().iter().filter(|&&b| b == XON).count(),
            1
        );
        assert!(!card.interrupt_pending());
    }

    #[test]
    fn batch_ingest_drops_half_when_full() {
        let (mut card, _sys) = test_card(1);

        let fill: Vec<u8> = vec![0x41; RX_FIFO_MAX];
        card.serial_rx_data(0, &fill);
        assert_eq!(card.uart_stats(0).fifo_size, RX_FIFO_MAX);

        // FIFO is full: just enough is dropped from the front to make room
        let burst: Vec<u8> = vec![0x42; 100];
        card.serial_rx_data(0, &burst);
        let stats = card.uart_stats(0);
        assert_eq!(stats.fifo_size, RX_FIFO_MAX);
        assert_eq!(stats.rx_overrun_drops, 100);

        // a burst larger than half the FIFO: at most half is evicted, and
        // whatever still does not fit counts as dropped
        let burst: Vec<u8> = vec![0x43; 2000];
        card.serial_rx_data(0, &burst);
        let stats = card.uart_stats(0);
        assert_eq!(stats.fifo_size, RX_FIFO_MAX);
        assert_eq!(stats.rx_overrun_drops, 100 + 2000);
    }

    #[test]
    fn interrupt_pending_tracks_fifo_occupancy() {
        let (mut card, _sys) = test_card(2);
        assert!(!card.interrupt_pending());

        card.serial_rx_byte(1, 0x41);
        assert!(card.interrupt_pending());

        card.state.uart_sel = 1;
        assert_eq!(card.state.port_read(IN_UART_DATA), 0x41);
        assert!(!card.interrupt_pending());

        // empty pop returns 0
        assert_eq!(card.state.port_read(IN_UART_DATA), 0x00);
    }

    #[test]
    fn obs_strobe_reads_back_inverted_and_clears() {
        let (mut card, _sys) = test_card(1);

        card.select(0x03);
        card.strobe_obs(0x41);
        assert!(card.state.obs_seen);

        let status = card.state.port_read(IN_2200_STATUS);
        assert_eq!(status & 0x01, 0x01); // obs_seen
        assert_eq!(status >> 5, 3); // io_offset

        assert_eq!(card.state.port_read(IN_OBUS_N), !0x41);
        assert!(!card.state.obs_seen);
        assert!(!card.state.cbs_seen);

        // the offset latched at strobe time is held separately
        assert_eq!(card.state.port_read(IN_OBSCBS_ADDR), 3 << 5);
    }

    #[test]
    #[should_panic(expected = "unconsumed")]
    fn double_strobe_is_fatal() {
        let (mut card, _sys) = test_card(1);
        card.select(0x01);
        card.strobe_obs(0x01);
        card.strobe_cbs(0x02);
    }

    #[test]
    fn rbi_gates_ready_busy_per_offset() {
        let (mut card, sys) = test_card(1);

        // all offsets ready except offset 1 stays ready (bit 0 clear)
        card.state.port_write(OUT_RBI, 0b1111_1110);
        card.select(0x01);
        assert_eq!(sys.dev_rdy(), Some(true));

        // offset 2 is masked busy (bit 1 set)
        card.select(0x02);
        assert_eq!(sys.dev_rdy(), Some(false));

        // firmware marks offset 1 busy; re-select reports busy
        card.state.port_write(OUT_RBI, 0b0000_0001);
        card.select(0x01);
        assert_eq!(sys.dev_rdy(), Some(false));

        // an unconsumed strobe holds offsets >= 4 busy regardless of rbi
        card.state.port_write(OUT_RBI, 0x00);
        card.select(0x05);
        assert_eq!(sys.dev_rdy(), Some(true));
        card.strobe_obs(0xAA);
        assert_eq!(sys.dev_rdy(), Some(false));

        card.deselect();
        assert_eq!(sys.dev_rdy(), Some(false));
        assert!(card.state.cpb);
    }

    #[test]
    fn ib_forced_high_at_offset_5() {
        let (mut card, _sys) = test_card(1);
        card.select(0x05);
        assert_eq!(card.get_ib(), 0x10);
        card.select(0x03);
        assert_eq!(card.get_ib(), 0x00);
    }

    #[test]
    fn uart_select_is_one_hot() {
        let (mut card, _sys) = test_card(4);
        card.state.port_write(OUT_UART_SEL, 0x04);
        assert_eq!(card.state.uart_sel, 2);
        card.state.port_write(OUT_UART_SEL, 0x01);
        assert_eq!(card.state.uart_sel, 0);
        card.state.port_write(OUT_UART_SEL, 0x08);
        assert_eq!(card.state.uart_sel, 3);
    }

    #[test]
    fn uart_data_write_fills_holding_register() {
        let (mut card, _sys) = test_card(1);
        card.state.port_write(OUT_UART_SEL, 0x01);
        assert_eq!(card.state.port_read(IN_UART_TXRDY), 0x00);

        card.state.port_write(OUT_UART_DATA, 0x41);
        assert!(!card.state.terms[0].tx_ready());
        assert_eq!(card.state.terms[0].tx_byte, 0x41);
        // channels poll as busy, inverted
        assert_eq!(card.state.port_read(IN_UART_TXRDY), 0x01);

        // writes to channels beyond num_terms are ignored
        card.state.port_write(OUT_UART_SEL, 0x08);
        card.state.port_write(OUT_UART_DATA, 0x42);
        assert!(card.state.terms[3].tx_ready());
    }

    #[test]
    fn uart_status_reports_dsr_for_configured_channels() {
        let (mut card, _sys) = test_card(2);
        card.state.port_write(OUT_UART_SEL, 0x02);
        let status = card.state.port_read(IN_UART_STATUS);
        assert_eq!(status & 0x80, 0x80); // dsr: channel 1 < num_terms
        assert_eq!(status & 0x01, 0x01); // tx ready
        assert_eq!(status & 0x04, 0x04); // tx empty

        card.state.port_write(OUT_UART_SEL, 0x08);
        let status = card.state.port_read(IN_UART_STATUS);
        assert_eq!(status & 0x80, 0x00); // channel 3 not configured
    }

    #[test]
    fn prime_latch_set_by_reset_cleared_by_out0() {
        let (mut card, _sys) = test_card(1);
        assert!(card.prime_seen()); // power-on state

        card.state.port_write(OUT_CLR_PRIME, 0x00);
        assert!(!card.prime_seen());

        card.reset(true);
        assert!(card.prime_seen());
        let status = card.state.port_read(IN_2200_STATUS);
        assert_eq!(status & 0x04, 0x04);
    }

    #[test]
    fn ib_output_is_double_inverted() {
        let (mut card, sys) = test_card(1);
        card.state.port_write(OUT_IB_N, !0x42);
        assert_eq!(sys.ibs(), vec![0x42]);

        card.state.port_write(OUT_IB9_N, !0x42);
        assert_eq!(sys.ibs(), vec![0x42, 0x142]);
    }

    #[test]
    fn keystrokes_discarded_on_serial_channels() {
        let (mut card, _sys) = test_card(2);

        // channel 0 has a (closed) serial port endpoint: input belongs to
        // the physical terminal
        let port = SerialPort::new();
        card.attach_serial_port(0, port);
        card.receive_keystroke(0, 0x41);
        assert_eq!(card.uart_stats(0).fifo_size, 0);

        // channel 1 has no serial endpoint and accepts keystrokes
        card.receive_keystroke(1, 0x41);
        assert_eq!(card.uart_stats(1).fifo_size, 1);
    }

    #[test]
    fn attach_replaces_prior_endpoint() {
        let (mut card, _sys) = test_card(1);
        let first = attach_sink(&mut card, 0);
        let second = attach_sink(&mut card, 0);

        card.state.terms[0].endpoint.send(0x41);
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(*second.lock().unwrap(), vec![0x41]);
        assert_eq!(card.endpoint_description(0).as_deref(), Some("Sink"));
    }

    #[test]
    fn addresses_follow_base() {
        let (card, _sys) = test_card(1);
        assert_eq!(card.addresses(), vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(card.name(), "2236 MXD");
    }
}
