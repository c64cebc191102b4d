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

    serial.rs

    Host serial port bridge for a physical Wang 2236/2336 terminal.

    A background receive thread reads the device with a short timeout and
    hands each byte to the registered callback. Transmits are written
    directly when the device accepts them; spillover lands in a bounded
    buffer the receive thread drains. A failed device enters reconnect mode
    with exponential backoff; exhausting the attempts leaves the channel
    quiescent until a new session is attached.
*/

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
        Mutex,
    },
    sync::Weak,
    thread,
    time::Duration,
};

/// Spillover TX buffer capacity in bytes.
pub const DEFAULT_TX_QUEUE_SIZE: usize = 8192;

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BASE_RECONNECT_DELAY_MS: u64 = 250;

/// Receive poll timeout. Purely a liveness bound so that stop requests and
/// TX drains take effect promptly.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(10);

const SUPPORTED_BAUD_RATES: [u32; 9] = [300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Line parameters and queue sizing for one terminal port.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// RTS/CTS. Wang terminals do not use it; persisted but ignored.
    pub hw_flow_control: bool,
    /// OS-level XON/XOFF regime, orthogonal to the UART-FIFO policy.
    pub sw_flow_control: bool,
    pub tx_queue_size: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            // Wang terminals run odd parity.
            parity: Parity::Odd,
            stop_bits: StopBits::One,
            hw_flow_control: false,
            sw_flow_control: false,
            tx_queue_size: DEFAULT_TX_QUEUE_SIZE,
        }
    }
}

impl SerialConfig {
    /// "/dev/ttyUSB0 at 19200 baud, 8O1, XON/XOFF"
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        let flow = match (self.hw_flow_control, self.sw_flow_control) {
            (true, true) => "RTS/CTS+XON/XOFF",
            (true, false) => "RTS/CTS",
            (false, true) => "XON/XOFF",
            (false, false) => "no flow control",
        };
        format!(
            "{} at {} baud, {}{}{}, {}",
            self.port_name, self.baud_rate, self.data_bits, parity, stop, flow
        )
    }
}

pub type RxCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Byte-level tap for the capture facility; the flag is true for RX.
pub type CaptureCallback = Arc<dyn Fn(u8, bool) + Send + Sync>;

pub struct SerialPort {
    weak_self: Weak<SerialPort>,
    config: Mutex<SerialConfig>,

    /// Writer clone of the device; the receive thread owns the reader.
    writer: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    outbuf: Mutex<VecDeque<u8>>,

    rx_callback: Mutex<Option<RxCallback>>,
    capture_callback: Mutex<Option<CaptureCallback>>,
    rx_thread: Mutex<Option<thread::JoinHandle<()>>>,

    stop_receiving: AtomicBool,
    connected: AtomicBool,

    rx_byte_count: AtomicU64,
    tx_byte_count: AtomicU64,

    xoff_sent: AtomicBool,
    xon_sent_count: AtomicU64,
    xoff_sent_count: AtomicU64,

    reconnect_attempts: AtomicU32,
}

impl SerialPort {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config: Mutex::new(SerialConfig::default()),
            writer: Mutex::new(None),
            outbuf: Mutex::new(VecDeque::new()),
            rx_callback: Mutex::new(None),
            capture_callback: Mutex::new(None),
            rx_thread: Mutex::new(None),
            stop_receiving: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            rx_byte_count: AtomicU64::new(0),
            tx_byte_count: AtomicU64::new(0),
            xoff_sent: AtomicBool::new(false),
            xon_sent_count: AtomicU64::new(0),
            xoff_sent_count: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    /// Open the device and start the receive thread. Returns false on
    /// failure; the caller decides whether to retry later.
    pub fn open(&self, config: &SerialConfig) -> bool {
        if self.is_open() {
            self.close();
        }

        *self.config.lock().unwrap() = config.clone();

        let device = match open_device(config) {
            Ok(device) => device,
            Err(e) => {
                log::warn!("failed to open {}: {}", config.port_name, e);
                return false;
            }
        };

        *self.writer.lock().unwrap() = match device.try_clone() {
            Ok(writer) => Some(writer),
            Err(e) => {
                // Without a writer clone all sends spill through the buffer
                // drained by the receive thread.
                log::warn!("could not clone {} for writing: {}", config.port_name, e);
                None
            }
        };

        self.stop_receiving.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        let weak = self.weak_self.clone();
        let handle = thread::Builder::new()
            .name(format!("serial-rx {}", config.port_name))
            .spawn(move || Self::receive_loop(weak, device));

        match handle {
            Ok(handle) => {
                *self.rx_thread.lock().unwrap() = Some(handle);
                log::info!("opened {}", config.describe());
                true
            }
            Err(e) => {
                log::error!("failed to spawn receive thread: {}", e);
                *self.writer.lock().unwrap() = None;
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop the receive thread, close the device, clear the TX buffer.
    /// Bounded by the receive poll timeout.
    pub fn close(&self) {
        self.stop_receiving.store(true, Ordering::SeqCst);
        if let Some(handle) = self.rx_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.writer.lock().unwrap() = None;
        self.outbuf.lock().unwrap().clear();
        if self.connected.swap(false, Ordering::SeqCst) {
            log::info!("closed {}", self.config.lock().unwrap().port_name);
        }
    }

    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> SerialConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn set_receive_callback(&self, cb: Option<RxCallback>) {
        *self.rx_callback.lock().unwrap() = cb;
    }

    pub fn set_capture_callback(&self, cb: Option<CaptureCallback>) {
        *self.capture_callback.lock().unwrap() = cb;
    }

    // ---- transmit ------------------------------------------------------

    /// Queue one byte for transmission. Writes directly when the device
    /// accepts it; otherwise spills into the TX buffer.
    pub fn send_byte(&self, byte: u8) {
        if !self.is_open() {
            log::debug!("port closed, dropping tx byte {:02x}", byte);
            return;
        }
        self.capture(byte, false);

        match self.try_write(&[byte]) {
            Some(1) => {
                self.tx_byte_count.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => self.enqueue_tx(&[byte]),
            None => {}
        }
    }

    pub fn send_data(&self, data: &[u8]) {
        if !self.is_open() {
            log::debug!("port closed, dropping {} tx bytes", data.len());
            return;
        }
        for &byte in data {
            self.capture(byte, false);
        }

        if let Some(written) = self.try_write(data) {
            self.tx_byte_count.fetch_add(written as u64, Ordering::Relaxed);
            if written < data.len() {
                self.enqueue_tx(&data[written..]);
            }
        }
    }

    /// Attempt an immediate write through the writer clone. `Some(n)` bytes
    /// were accepted (possibly zero when the device would block or no
    /// writer handle exists); `None` on a hard error.
    fn try_write(&self, data: &[u8]) -> Option<usize> {
        let mut writer = self.writer.lock().unwrap();
        match writer.as_mut() {
            Some(device) => match device.write(data) {
                Ok(written) => Some(written),
                Err(e) if would_block(&e) => Some(0),
                Err(e) => {
                    log::warn!("serial write failed: {}", e);
                    None
                }
            },
            None => Some(0),
        }
    }

    /// Application-level flow control toward the terminal. Idempotent with
    /// respect to the port's own xoff flag.
    pub fn send_xon(&self) {
        if self
            .xoff_sent
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.send_byte(crate::devices::termmux::uart::XON);
            self.xon_sent_count.fetch_add(1, Ordering::Relaxed);
            log::debug!("sent XON to {}", self.config.lock().unwrap().port_name);
        }
    }

    pub fn send_xoff(&self) {
        if self
            .xoff_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.send_byte(crate::devices::termmux::uart::XOFF);
            self.xoff_sent_count.fetch_add(1, Ordering::Relaxed);
            log::debug!("sent XOFF to {}", self.config.lock().unwrap().port_name);
        }
    }

    pub fn is_xoff_sent(&self) -> bool {
        self.xoff_sent.load(Ordering::SeqCst)
    }

    // ---- backpressure signals -----------------------------------------

    pub fn tx_queue_size(&self) -> usize {
        self.outbuf.lock().unwrap().len()
    }

    pub fn tx_queue_capacity(&self) -> usize {
        self.config.lock().unwrap().tx_queue_size
    }

    /// Clear the TX buffer without sending (shutdown path).
    pub fn flush_tx_queue(&self) {
        self.outbuf.lock().unwrap().clear();
    }

    // ---- statistics ----------------------------------------------------

    pub fn rx_byte_count(&self) -> u64 {
        self.rx_byte_count.load(Ordering::Relaxed)
    }

    pub fn tx_byte_count(&self) -> u64 {
        self.tx_byte_count.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    // ---- internals -----------------------------------------------------

    fn capture(&self, byte: u8, is_rx: bool) {
        let cb = self.capture_callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(byte, is_rx);
        }
    }

    fn enqueue_tx(&self, data: &[u8]) {
        let capacity = self.tx_queue_capacity();
        let mut outbuf = self.outbuf.lock().unwrap();
        if outbuf.len() + data.len() > capacity {
            log::warn!(
                "tx buffer full ({} + {} > {}), dropping data",
                outbuf.len(),
                data.len(),
                capacity
            );
            return;
        }
        outbuf.extend(data.iter().copied());
    }

    /// Drain as much of the TX buffer as the device accepts.
    fn flush_tx_buffer(&self) {
        let mut outbuf = self.outbuf.lock().unwrap();
        if outbuf.is_empty() {
            return;
        }
        let mut writer = self.writer.lock().unwrap();
        let device = match writer.as_mut() {
            Some(device) => device,
            None => return,
        };

        outbuf.make_contiguous();
        let (head, _) = outbuf.as_slices();
        match device.write(head) {
            Ok(written) => {
                self.tx_byte_count.fetch_add(written as u64, Ordering::Relaxed);
                outbuf.drain(..written);
            }
            Err(e) if would_block(&e) => {}
            Err(e) => log::warn!("tx drain failed: {}", e),
        }
    }

    fn process_received_byte(&self, byte: u8) {
        self.rx_byte_count.fetch_add(1, Ordering::Relaxed);
        self.capture(byte, true);
        let cb = self.rx_callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(byte);
        }
    }

    /// Receive thread body: poll the device with a short timeout, dispatch
    /// bytes, drain pending TX, and enter reconnect mode on hard errors.
    /// Holds only a weak reference between iterations, so the thread winds
    /// down by itself if the port is dropped.
    fn receive_loop(weak: Weak<SerialPort>, mut device: Box<dyn serialport::SerialPort>) {
        let mut buf = [0u8; 512];

        loop {
            let port = match weak.upgrade() {
                Some(port) => port,
                None => return,
            };
            if port.stop_receiving.load(Ordering::SeqCst) {
                break;
            }

            match device.read(&mut buf) {
                Ok(0) => {
                    log::warn!("serial device disconnected");
                    if !port.reconnect(&mut device) {
                        break;
                    }
                }
                Ok(n) => {
                    for &byte in &buf[..n] {
                        port.process_received_byte(byte);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("serial read failed: {}", e);
                    if !port.reconnect(&mut device) {
                        break;
                    }
                }
            }

            port.flush_tx_buffer();
        }

        if let Some(port) = weak.upgrade() {
            port.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Reopen the device with exponential backoff:
    /// 250 ms, 500 ms, 1 s, 2 s, 4 s, 8 s, then capped at 10 s, for at most
    /// ten attempts. On success the attempt counter resets.
    fn reconnect(&self, device: &mut Box<dyn serialport::SerialPort>) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().unwrap() = None;

        loop {
            let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                log::error!("max reconnect attempts exceeded, giving up");
                return false;
            }

            let delay_ms = reconnect_delay_ms(attempts);
            log::info!(
                "reconnecting in {} ms (attempt {}/{})",
                delay_ms,
                attempts + 1,
                MAX_RECONNECT_ATTEMPTS
            );
            if !self.interruptible_sleep(delay_ms) {
                return false;
            }
            self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);

            let config = self.config.lock().unwrap().clone();
            match open_device(&config) {
                Ok(new_device) => {
                    *self.writer.lock().unwrap() = new_device.try_clone().ok();
                    *device = new_device;
                    self.connected.store(true, Ordering::SeqCst);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    log::info!("reconnected to {}", config.port_name);
                    return true;
                }
                Err(e) => log::warn!("reconnect to {} failed: {}", config.port_name, e),
            }
        }
    }

    /// Sleep in small slices so that close() still takes effect promptly
    /// while the port is backing off. Returns false if a stop was requested.
    fn interruptible_sleep(&self, total_ms: u64) -> bool {
        let mut remaining = total_ms;
        while remaining > 0 {
            if self.stop_receiving.load(Ordering::SeqCst) {
                return false;
            }
            let slice = remaining.min(50);
            thread::sleep(Duration::from_millis(slice));
            remaining -= slice;
        }
        !self.stop_receiving.load(Ordering::SeqCst)
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        // Threads hold an Arc to the port, so by the time Drop runs the
        // receive thread is already gone; this only tidies the handle.
        self.stop_receiving.store(true, Ordering::SeqCst);
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn reconnect_delay_ms(attempts: u32) -> u64 {
    let delay = BASE_RECONNECT_DELAY_MS << attempts.min(5);
    delay.min(10_000)
}

fn open_device(config: &SerialConfig) -> serialport::Result<Box<dyn serialport::SerialPort>> {
    let baud_rate = if SUPPORTED_BAUD_RATES.contains(&config.baud_rate) {
        config.baud_rate
    } else {
        log::warn!("unsupported baud rate {}, using 19200", config.baud_rate);
        19200
    };

    let data_bits = match config.data_bits {
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        n => {
            log::warn!("invalid data bits {}, using 8", n);
            serialport::DataBits::Eight
        }
    };

    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    };

    let stop_bits = match config.stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    };

    // Hardware flow control is never used with Wang terminals, but the
    // setting is honored if configured.
    let flow_control = if config.hw_flow_control {
        serialport::FlowControl::Hardware
    } else if config.sw_flow_control {
        serialport::FlowControl::Software
    } else {
        serialport::FlowControl::None
    };

    serialport::new(config.port_name.clone(), baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(READ_POLL_TIMEOUT)
        .open()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_doubles_then_caps() {
        assert_eq!(reconnect_delay_ms(0), 250);
        assert_eq!(reconnect_delay_ms(1), 500);
        assert_eq!(reconnect_delay_ms(2), 1_000);
        assert_eq!(reconnect_delay_ms(5), 8_000);
        // Further attempts stay at the cap.
        assert_eq!(reconnect_delay_ms(6), 10_000);
        assert_eq!(reconnect_delay_ms(9), 10_000);
    }

    #[test]
    fn describe_formats_line_settings() {
        let config = SerialConfig {
            port_name: "/dev/ttyUSB2".into(),
            sw_flow_control: true,
            ..Default::default()
        };
        assert_eq!(
            config.describe(),
            "/dev/ttyUSB2 at 19200 baud, 8O1, XON/XOFF"
        );
    }

    #[test]
    fn xon_xoff_alternate_on_closed_port() {
        // The flow-control flag toggles even when the device is gone; the
        // byte itself is dropped by send_byte.
        let port = SerialPort::new();
        assert!(!port.is_xoff_sent());
        port.send_xoff();
        assert!(port.is_xoff_sent());
        assert_eq!(port.xoff_sent_count.load(Ordering::Relaxed), 1);
        // Second XOFF is a no-op.
        port.send_xoff();
        assert_eq!(port.xoff_sent_count.load(Ordering::Relaxed), 1);
        port.send_xon();
        assert!(!port.is_xoff_sent());
        assert_eq!(port.xon_sent_count.load(Ordering::Relaxed), 1);
        // XON without a preceding XOFF is a no-op.
        port.send_xon();
        assert_eq!(port.xon_sent_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tx_buffer_bounds_are_enforced() {
        let port = SerialPort::new();
        port.connected.store(true, Ordering::SeqCst);
        let data = vec![0xAA; DEFAULT_TX_QUEUE_SIZE];
        port.enqueue_tx(&data);
        assert_eq!(port.tx_queue_size(), DEFAULT_TX_QUEUE_SIZE);
        // One more byte would exceed capacity and is dropped whole.
        port.enqueue_tx(&[0xBB]);
        assert_eq!(port.tx_queue_size(), DEFAULT_TX_QUEUE_SIZE);
        port.flush_tx_queue();
        assert_eq!(port.tx_queue_size(), 0);
    }
}
