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

    session.rs

    Terminal session abstraction between the MXD and a concrete terminal
    transport. The forward path is `mxd_to_term`; the reverse path is a
    callback the session registers with its transport at construction.
*/

use std::sync::Arc;

use crate::serial::{RxCallback, SerialPort};

/// A terminal endpoint the MXD can talk to without knowing the transport.
pub trait TermSession: Send {
    /// Send a byte from the MXD to the terminal.
    fn mxd_to_term(&mut self, byte: u8);

    /// True if the session can currently move data.
    fn is_active(&self) -> bool;

    /// Human-readable description, e.g. "Serial:/dev/ttyUSB0".
    fn description(&self) -> String;

    /// TX-queue fullness of the transport, 0.0..=1.0, for backpressure.
    fn tx_fullness(&self) -> f32 {
        0.0
    }
}

/// Session for a physical Wang terminal on a host serial port.
///
/// Construction registers `term_to_mxd` as the port's receive callback;
/// dropping the session clears it again.
pub struct SerialTermSession {
    port: Arc<SerialPort>,
}

impl SerialTermSession {
    pub fn new(port: Arc<SerialPort>, term_to_mxd: RxCallback) -> Self {
        port.set_receive_callback(Some(term_to_mxd));
        let session = Self { port };
        log::debug!("created session for {}", session.description());
        session
    }

    pub fn port(&self) -> &Arc<SerialPort> {
        &self.port
    }

    /// (rx bytes, tx bytes) moved by the underlying port.
    pub fn stats(&self) -> (u64, u64) {
        (self.port.rx_byte_count(), self.port.tx_byte_count())
    }
}

impl TermSession for SerialTermSession {
    fn mxd_to_term(&mut self, byte: u8) {
        // Dropping while closed is normal during startup/shutdown.
        if self.port.is_open() {
            self.port.send_byte(byte);
        }
    }

    fn is_active(&self) -> bool {
        self.port.is_open()
    }

    fn description(&self) -> String {
        format!("Serial:{}", self.port.config().port_name)
    }

    fn tx_fullness(&self) -> f32 {
        let capacity = self.port.tx_queue_capacity();
        if capacity == 0 {
            0.0
        } else {
            self.port.tx_queue_size() as f32 / capacity as f32
        }
    }
}

impl Drop for SerialTermSession {
    fn drop(&mut self) {
        self.port.set_receive_callback(None);
        let (rx, tx) = self.stats();
        log::debug!(
            "destroyed session for {} (rx: {}, tx: {})",
            self.description(),
            rx,
            tx
        );
    }
}
