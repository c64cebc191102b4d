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

    bus.rs

    Contracts between an I/O card and the Wang 2200 CPU.

    The CPU side (microcode engine) is an external collaborator: the card
    implements `IoCard`, and calls back into the system through a
    `System2200` handle it owns. The terminal server substitutes a stub for
    the latter; tests substitute a recorder.
*/

/// The I/O-card face of the 2200 bus. Selection is edge-triggered: the CPU
/// addresses a card with `select`, then exchanges bytes via the OBS/CBS
/// strobes and the IB input path until `deselect`.
pub trait IoCard {
    /// !PRMS. A hard reset is identical to a warm reset from the card's
    /// point of view.
    fn reset(&mut self, hard_reset: bool);

    /// Card addressed at `addr`; the card decodes the low three bits.
    fn select(&mut self, addr: u8);
    fn deselect(&mut self);

    /// Output-Byte Strobe / Control-Byte Strobe: a byte written by the CPU.
    fn strobe_obs(&mut self, val: u8);
    fn strobe_cbs(&mut self, val: u8);

    /// Value the card drives onto the IB lines while selected.
    fn get_ib(&self) -> u8;

    /// Change of the CPU-busy state (CPB).
    fn set_cpu_busy(&mut self, busy: bool);

    /// Addresses this card instance responds to.
    fn addresses(&self) -> Vec<u8>;

    /// Base addresses a card of this type can be mapped at; default first.
    fn base_addresses(&self) -> Vec<u8>;

    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
}

/// Callbacks from an I/O card into the host CPU and system. On real
/// hardware these are bus wires; here they are methods on a handle the
/// card owns.
pub trait System2200 {
    /// Drive a (9-bit) value onto the CPU's IBS lines.
    fn io_card_cb_ibs(&mut self, val: u16);

    /// Ready/busy output toward the CPU (true = ready).
    fn set_dev_rdy(&mut self, ready: bool);

    /// Halt the 2200 CPU (OUT_HALT_STEP strobe).
    fn halt(&mut self);

    /// Issue a warm reset to the whole system (OUT_PRIME strobe).
    fn warm_reset(&mut self);
}

/// System stub for the terminal server, which runs the MXD without a 2200
/// microcode engine attached. Bus callbacks are logged and dropped.
#[derive(Default)]
pub struct NullSystem {
    dev_rdy: bool,
}

impl NullSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dev_rdy(&self) -> bool {
        self.dev_rdy
    }
}

/// Shared-handle system recorder: every bus callback is captured so that
/// tests (and diagnostics) can observe what the firmware drove onto the
/// 2200 bus. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingSystem {
    inner: std::sync::Arc<std::sync::Mutex<SystemRecord>>,
}

#[derive(Default)]
struct SystemRecord {
    ibs: Vec<u16>,
    dev_rdy: Option<bool>,
    halts: u32,
    warm_resets: u32,
}

impl RecordingSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every value driven onto the IBS lines, in order.
    pub fn ibs(&self) -> Vec<u16> {
        self.inner.lock().unwrap().ibs.clone()
    }

    /// Most recent ready/busy output, or None if never driven.
    pub fn dev_rdy(&self) -> Option<bool> {
        self.inner.lock().unwrap().dev_rdy
    }

    pub fn halts(&self) -> u32 {
        self.inner.lock().unwrap().halts
    }

    pub fn warm_resets(&self) -> u32 {
        self.inner.lock().unwrap().warm_resets
    }
}

impl System2200 for RecordingSystem {
    fn io_card_cb_ibs(&mut self, val: u16) {
        self.inner.lock().unwrap().ibs.push(val);
    }

    fn set_dev_rdy(&mut self, ready: bool) {
        self.inner.lock().unwrap().dev_rdy = Some(ready);
    }

    fn halt(&mut self) {
        self.inner.lock().unwrap().halts += 1;
    }

    fn warm_reset(&mut self) {
        self.inner.lock().unwrap().warm_resets += 1;
    }
}

impl System2200 for NullSystem {
    fn io_card_cb_ibs(&mut self, val: u16) {
        log::trace!("ibs <- {:03x}", val);
    }

    fn set_dev_rdy(&mut self, ready: bool) {
        self.dev_rdy = ready;
    }

    fn halt(&mut self) {
        log::warn!("mxd firmware requested cpu halt (no cpu attached)");
    }

    fn warm_reset(&mut self) {
        log::info!("mxd firmware requested warm reset (no cpu attached)");
    }
}
