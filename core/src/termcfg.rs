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

    termcfg.rs

    MXD card configuration: how many terminals are active and how each one
    is wired to a host serial device. The card reads and writes subgroup
    "io/slot-N/cardcfg" of an external key/value configuration store,
    reached through the `ConfigStore` trait.
*/

use serde::{Deserialize, Serialize};

use crate::serial::{Parity, SerialConfig, StopBits, DEFAULT_TX_QUEUE_SIZE};

pub const MAX_TERMINALS: usize = 4;

/// Key/value configuration store, provided by the surrounding system.
/// Reads fall back to the given default when the key is absent.
pub trait ConfigStore {
    fn read_str(&self, subgroup: &str, key: &str, default: &str) -> String;
    fn read_int(&self, subgroup: &str, key: &str, default: i64) -> i64;
    fn read_bool(&self, subgroup: &str, key: &str, default: bool) -> bool;

    fn write_str(&mut self, subgroup: &str, key: &str, value: &str);
    fn write_int(&mut self, subgroup: &str, key: &str, value: i64);
    fn write_bool(&mut self, subgroup: &str, key: &str, value: bool);
}

/// Per-terminal wiring. An empty `com_port` means the channel has no
/// serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCfg {
    pub com_port: String,
    pub baud_rate: u32,
    /// Hardware flow control; ignored for Wang terminals but persisted.
    pub flow_control: bool,
    /// OS-level XON/XOFF regime.
    pub sw_flow_control: bool,
}

impl Default for TerminalCfg {
    fn default() -> Self {
        Self {
            com_port: String::new(),
            baud_rate: 19200,
            flow_control: false,
            sw_flow_control: false,
        }
    }
}

impl TerminalCfg {
    pub fn has_com_port(&self) -> bool {
        !self.com_port.is_empty()
    }

    pub fn to_serial_config(&self) -> SerialConfig {
        SerialConfig {
            port_name: self.com_port.clone(),
            baud_rate: self.baud_rate,
            data_bits: 8,
            // Wang terminals run 8O1.
            parity: Parity::Odd,
            stop_bits: StopBits::One,
            hw_flow_control: false,
            sw_flow_control: self.sw_flow_control,
            tx_queue_size: DEFAULT_TX_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermMuxCfg {
    num_terminals: usize,
    terminals: [TerminalCfg; MAX_TERMINALS],
}

impl Default for TermMuxCfg {
    fn default() -> Self {
        Self {
            num_terminals: 1,
            terminals: Default::default(),
        }
    }
}

impl TermMuxCfg {
    /// Config subgroup for the card in slot `slot`.
    pub fn subgroup(slot: usize) -> String {
        format!("io/slot-{}/cardcfg", slot)
    }

    pub fn num_terminals(&self) -> usize {
        self.num_terminals
    }

    /// Clamped to 1..=4; out-of-range input is a configuration error and
    /// is corrected with a warning.
    pub fn set_num_terminals(&mut self, count: usize) {
        if !(1..=MAX_TERMINALS).contains(&count) {
            log::warn!("numTerminals {} out of range, clamping", count);
        }
        self.num_terminals = count.clamp(1, MAX_TERMINALS);
    }

    pub fn terminal(&self, n: usize) -> &TerminalCfg {
        &self.terminals[n]
    }

    pub fn terminal_mut(&mut self, n: usize) -> &mut TerminalCfg {
        &mut self.terminals[n]
    }

    pub fn load(store: &dyn ConfigStore, subgroup: &str) -> Self {
        let mut cfg = Self::default();

        let num = store.read_int(subgroup, "numTerminals", 1);
        if !(1..=MAX_TERMINALS as i64).contains(&num) {
            log::warn!("config state messed up -- assuming something reasonable");
            cfg.set_num_terminals(1);
        } else {
            cfg.set_num_terminals(num as usize);
        }

        for (n, term) in cfg.terminals.iter_mut().enumerate() {
            let prefix = format!("terminal{}_", n);
            term.com_port = store.read_str(subgroup, &format!("{}com_port", prefix), "");
            term.baud_rate =
                store.read_int(subgroup, &format!("{}baud_rate", prefix), 19200) as u32;
            term.flow_control =
                store.read_bool(subgroup, &format!("{}flow_control", prefix), false);
            term.sw_flow_control =
                store.read_bool(subgroup, &format!("{}sw_flow_control", prefix), false);
        }

        cfg
    }

    pub fn save(&self, store: &mut dyn ConfigStore, subgroup: &str) {
        store.write_int(subgroup, "numTerminals", self.num_terminals as i64);

        for (n, term) in self.terminals.iter().enumerate() {
            let prefix = format!("terminal{}_", n);
            store.write_str(subgroup, &format!("{}com_port", prefix), &term.com_port);
            store.write_int(
                subgroup,
                &format!("{}baud_rate", prefix),
                term.baud_rate as i64,
            );
            store.write_bool(
                subgroup,
                &format!("{}flow_control", prefix),
                term.flow_control,
            );
            store.write_bool(
                subgroup,
                &format!("{}sw_flow_control", prefix),
                term.sw_flow_control,
            );
        }
    }

    /// True if applying `other` requires tearing the card down and
    /// rebuilding it (channel count or any wiring changed).
    pub fn needs_reboot(&self, other: &Self) -> bool {
        self != other
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory store mirroring the external configuration interface.
    #[derive(Default)]
    pub(crate) struct MemStore {
        values: HashMap<(String, String), String>,
    }

    impl ConfigStore for MemStore {
        fn read_str(&self, subgroup: &str, key: &str, default: &str) -> String {
            self.values
                .get(&(subgroup.to_string(), key.to_string()))
                .cloned()
                .unwrap_or_else(|| default.to_string())
        }

        fn read_int(&self, subgroup: &str, key: &str, default: i64) -> i64 {
            self.values
                .get(&(subgroup.to_string(), key.to_string()))
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn read_bool(&self, subgroup: &str, key: &str, default: bool) -> bool {
            self.read_int(subgroup, key, default as i64) != 0
        }

        fn write_str(&mut self, subgroup: &str, key: &str, value: &str) {
            self.values
                .insert((subgroup.to_string(), key.to_string()), value.to_string());
        }

        fn write_int(&mut self, subgroup: &str, key: &str, value: i64) {
            self.write_str(subgroup, key, &value.to_string());
        }

        fn write_bool(&mut self, subgroup: &str, key: &str, value: bool) {
            self.write_int(subgroup, key, value as i64);
        }
    }

    #[test]
    fn defaults_when_store_is_empty() {
        let store = MemStore::default();
        let cfg = TermMuxCfg::load(&store, "io/slot-2/cardcfg");
        assert_eq!(cfg.num_terminals(), 1);
        assert!(!cfg.terminal(0).has_com_port());
        assert_eq!(cfg.terminal(0).baud_rate, 19200);
    }

    #[test]
    fn out_of_range_terminal_count_is_corrected() {
        let mut store = MemStore::default();
        store.write_int("g", "numTerminals", 9);
        let cfg = TermMuxCfg::load(&store, "g");
        assert_eq!(cfg.num_terminals(), 1);
    }

    #[test]
    fn save_load_round_trip() {
        let mut cfg = TermMuxCfg::default();
        cfg.set_num_terminals(3);
        cfg.terminal_mut(0).com_port = "/dev/ttyUSB0".into();
        cfg.terminal_mut(0).sw_flow_control = true;
        cfg.terminal_mut(2).com_port = "/dev/ttyUSB2".into();
        cfg.terminal_mut(2).baud_rate = 9600;

        let mut store = MemStore::default();
        let subgroup = TermMuxCfg::subgroup(2);
        cfg.save(&mut store, &subgroup);

        let reloaded = TermMuxCfg::load(&store, &subgroup);
        assert_eq!(cfg, reloaded);
        assert!(!cfg.needs_reboot(&reloaded));
    }

    #[test]
    fn wiring_change_needs_reboot() {
        let cfg = TermMuxCfg::default();
        let mut other = cfg.clone();
        other.terminal_mut(1).baud_rate = 300;
        assert!(cfg.needs_reboot(&other));
    }

    #[test]
    fn serial_config_conversion() {
        let mut term = TerminalCfg::default();
        term.com_port = "/dev/ttyUSB1".into();
        term.baud_rate = 9600;
        term.sw_flow_control = true;
        let sc = term.to_serial_config();
        assert_eq!(sc.port_name, "/dev/ttyUSB1");
        assert_eq!(sc.baud_rate, 9600);
        assert_eq!(sc.data_bits, 8);
        assert_eq!(sc.parity, Parity::Odd);
        assert!(sc.sw_flow_control);
        assert!(!sc.hw_flow_control);
    }
}
