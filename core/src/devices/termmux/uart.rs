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

    devices::termmux::uart.rs

    One UART channel of the MXD: a one-deep transmit holding register paced
    by a character-time timer, and a bounded receive FIFO with XON/XOFF
    hysteresis toward the attached endpoint.

    The endpoint is at most one of a host serial port, a terminal session,
    or nothing. Bytes from the endpoint's receive thread arrive through a
    bounded channel and are folded into the FIFO on the emulation thread
    only; all flow-control decisions happen there.
*/

use std::{collections::VecDeque, sync::Arc};

use crossbeam_channel::Receiver;

use crate::{scheduler::TimerHandle, serial::SerialPort, session::TermSession};

/// Receive FIFO depth per channel.
pub const RX_FIFO_MAX: usize = 2048;

/// Send XOFF when the FIFO reaches 75% full.
pub const RX_FIFO_XOFF_THRESHOLD: usize = RX_FIFO_MAX * 3 / 4;

/// Send XON once the FIFO has drained to 25%.
pub const RX_FIFO_XON_THRESHOLD: usize = RX_FIFO_MAX / 4;

/// DC1/DC3 software flow control bytes. Consumed at the boundary; the
/// firmware never sees them.
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;

/// What a UART channel is wired to.
pub enum Endpoint {
    /// A host serial port with a physical terminal on the other end.
    Serial {
        port: Arc<SerialPort>,
        rx: Receiver<u8>,
    },
    /// A terminal session abstraction (allows non-serial endpoints later).
    Session {
        session: Box<dyn TermSession>,
        rx: Receiver<u8>,
    },
    None,
}

impl Endpoint {
    pub fn is_open(&self) -> bool {
        match self {
            Endpoint::Serial { port, .. } => port.is_open(),
            Endpoint::Session { session, .. } => session.is_active(),
            Endpoint::None => false,
        }
    }

    pub fn send(&mut self, byte: u8) {
        match self {
            Endpoint::Serial { port, .. } => port.send_byte(byte),
            Endpoint::Session { session, .. } => session.mxd_to_term(byte),
            Endpoint::None => {}
        }
    }

    /// TX-queue fullness of the far side, 0.0..=1.0. Used by the character
    /// timer to back off instead of overrunning a slow device.
    pub fn tx_fullness(&self) -> f32 {
        match self {
            Endpoint::Serial { port, .. } => {
                let capacity = port.tx_queue_capacity();
                if capacity == 0 {
                    0.0
                } else {
                    port.tx_queue_size() as f32 / capacity as f32
                }
            }
            Endpoint::Session { session, .. } => session.tx_fullness(),
            Endpoint::None => 0.0,
        }
    }

    fn try_recv(&self) -> Option<u8> {
        match self {
            Endpoint::Serial { rx, .. } | Endpoint::Session { rx, .. } => rx.try_recv().ok(),
            Endpoint::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UartStats {
    pub fifo_size: usize,
    pub rx_overrun_drops: u32,
    pub xon_sent_count: u64,
    pub xoff_sent_count: u64,
    pub xoff_sent: bool,
}

pub struct UartChannel {
    // transmit state (1-deep holding register)
    pub(super) tx_ready: bool,
    pub(super) tx_byte: u8,
    pub(super) tx_tmr: Option<TimerHandle>,

    // receive state
    rx_fifo: VecDeque<u8>,
    rx_overrun_drops: u32,

    // flow control
    xoff_sent: bool,
    xoff_sent_count: u64,
    xon_sent_count: u64,

    pub(super) endpoint: Endpoint,
}

impl UartChannel {
    pub fn new() -> Self {
        Self {
            tx_ready: true,
            tx_byte: 0x00,
            tx_tmr: None,
            rx_fifo: VecDeque::new(),
            rx_overrun_drops: 0,
            xoff_sent: false,
            xoff_sent_count: 0,
            xon_sent_count: 0,
            endpoint: Endpoint::None,
        }
    }

    pub fn tx_ready(&self) -> bool {
        self.tx_ready
    }

    /// TX serializer idle: holding register empty and no character in flight.
    pub fn tx_empty(&self) -> bool {
        self.tx_ready && self.tx_tmr.is_none()
    }

    pub fn rx_empty(&self) -> bool {
        self.rx_fifo.is_empty()
    }

    pub fn rx_len(&self) -> usize {
        self.rx_fifo.len()
    }

    pub fn stats(&self) -> UartStats {
        UartStats {
            fifo_size: self.rx_fifo.len(),
            rx_overrun_drops: self.rx_overrun_drops,
            xon_sent_count: self.xon_sent_count,
            xoff_sent_count: self.xoff_sent_count,
            xoff_sent: self.xoff_sent,
        }
    }

    /// One byte from the terminal toward the firmware. XON/XOFF are
    /// consumed here; they never enter the FIFO. On overflow the oldest
    /// byte is dropped and counted.
    pub fn enqueue_rx(&mut self, byte: u8) {
        if byte == XON || byte == XOFF {
            log::trace!("filtering flow control byte {:02x} from terminal", byte);
            return;
        }

        if self.rx_fifo.len() >= RX_FIFO_MAX {
            self.rx_fifo.pop_front();
            self.rx_overrun_drops = self.rx_overrun_drops.wrapping_add(1);
        }
        self.rx_fifo.push_back(byte);

        // XOFF goes out as soon as the high watermark is crossed.
        if self.rx_fifo.len() >= RX_FIFO_XOFF_THRESHOLD && !self.xoff_sent {
            self.send_xoff();
        }
    }

    /// Batch ingest. Inserts as many bytes as fit; when the FIFO is already
    /// full, up to half of it is dropped from the front to make room, and
    /// every byte that still does not fit counts as an overrun drop.
    pub fn enqueue_rx_batch(&mut self, data: &[u8]) {
        let mut remaining = data.iter().filter(|&&b| b != XON && b != XOFF).count();
        if remaining == 0 {
            return;
        }

        let mut available = RX_FIFO_MAX.saturating_sub(self.rx_fifo.len());
        if available == 0 {
            let to_drop = remaining.min(RX_FIFO_MAX / 2);
            for _ in 0..to_drop {
                if self.rx_fifo.pop_front().is_some() {
                    self.rx_overrun_drops = self.rx_overrun_drops.wrapping_add(1);
                }
            }
            available = RX_FIFO_MAX - self.rx_fifo.len();
        }

        for &byte in data.iter().filter(|&&b| b != XON && b != XOFF) {
            if available == 0 {
                break;
            }
            self.rx_fifo.push_back(byte);
            available -= 1;
            remaining -= 1;
        }

        // Bytes that did not fit are counted as dropped.
        self.rx_overrun_drops = self.rx_overrun_drops.wrapping_add(remaining as u32);

        if self.rx_fifo.len() >= RX_FIFO_XOFF_THRESHOLD && !self.xoff_sent {
            self.send_xoff();
        }
    }

    /// Firmware side: pop the oldest received byte (IN_UART_DATA).
    pub fn pop_rx(&mut self) -> Option<u8> {
        self.rx_fifo.pop_front()
    }

    pub fn front_rx(&self) -> Option<u8> {
        self.rx_fifo.front().copied()
    }

    /// Hysteresis: XOFF at or above the high watermark, XON at or below the
    /// low one. The `xoff_sent` flag enforces strict alternation.
    pub fn check_flow_control(&mut self) {
        let fifo_size = self.rx_fifo.len();
        if fifo_size >= RX_FIFO_XOFF_THRESHOLD && !self.xoff_sent {
            self.send_xoff();
        } else if fifo_size <= RX_FIFO_XON_THRESHOLD && self.xoff_sent {
            self.send_xon();
        }
    }

    fn send_xon(&mut self) {
        if !self.endpoint.is_open() {
            return;
        }
        match &mut self.endpoint {
            Endpoint::Serial { port, .. } => port.send_xon(),
            Endpoint::Session { session, .. } => session.mxd_to_term(XON),
            Endpoint::None => unreachable!(),
        }
        self.xoff_sent = false;
        self.xon_sent_count += 1;
        log::debug!("sent xon (fifo size {})", self.rx_fifo.len());
    }

    fn send_xoff(&mut self) {
        if !self.endpoint.is_open() {
            return;
        }
        match &mut self.endpoint {
            Endpoint::Serial { port, .. } => port.send_xoff(),
            Endpoint::Session { session, .. } => session.mxd_to_term(XOFF),
            Endpoint::None => unreachable!(),
        }
        self.xoff_sent = true;
        self.xoff_sent_count += 1;
        log::debug!("sent xoff (fifo size {})", self.rx_fifo.len());
    }

    /// Fold bytes pushed by the endpoint's receive thread into the FIFO.
    /// Returns true if anything arrived.
    pub fn pump_rx(&mut self) -> bool {
        let mut any = false;
        while let Some(byte) = self.endpoint.try_recv() {
            self.enqueue_rx(byte);
            any = true;
        }
        if any && self.rx_fifo.len() <= RX_FIFO_XON_THRESHOLD && self.xoff_sent {
            self.check_flow_control();
        }
        any
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn has_serial_endpoint(&self) -> bool {
        matches!(self.endpoint, Endpoint::Serial { .. })
    }
}

impl Default for UartChannel {
    fn default() -> Self {
        Self::new()
    }
}
