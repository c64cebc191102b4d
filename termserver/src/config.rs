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

    config.rs

    TOML-backed implementation of the core's key/value configuration store.
    Subgroups like "io/slot-2/cardcfg" map to nested tables; the whole
    store round-trips through one file.
*/

use std::path::{Path, PathBuf};

use anyhow::Context;
use toml::{Table, Value};

use wangmux_core::termcfg::ConfigStore;

pub struct TomlConfigStore {
    path: PathBuf,
    root: Table,
}

impl TomlConfigStore {
    /// Load the store from `path`. A missing file is not an error; the
    /// store starts empty and is created on save.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let root = match std::fs::read_to_string(path) {
            Ok(text) => text
                .parse::<Table>()
                .with_context(|| format!("malformed config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "config file {} not found, starting with defaults",
                    path.display()
                );
                Table::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(&self.root).context("serializing configuration")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        log::debug!("configuration saved to {}", self.path.display());
        Ok(())
    }

    fn subgroup_table(&self, subgroup: &str) -> Option<&Table> {
        let mut table = &self.root;
        for segment in subgroup.split('/') {
            table = table.get(segment)?.as_table()?;
        }
        Some(table)
    }

    fn subgroup_table_mut(&mut self, subgroup: &str) -> &mut Table {
        let mut table = &mut self.root;
        for segment in subgroup.split('/') {
            table = table
                .entry(segment.to_string())
                .or_insert_with(|| Value::Table(Table::new()))
                .as_table_mut()
                .expect("subgroup path collides with a scalar key");
        }
        table
    }

    fn get(&self, subgroup: &str, key: &str) -> Option<&Value> {
        self.subgroup_table(subgroup)?.get(key)
    }
}

impl ConfigStore for TomlConfigStore {
    fn read_str(&self, subgroup: &str, key: &str, default: &str) -> String {
        match self.get(subgroup, key).and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => default.to_string(),
        }
    }

    fn read_int(&self, subgroup: &str, key: &str, default: i64) -> i64 {
        self.get(subgroup, key)
            .and_then(Value::as_integer)
            .unwrap_or(default)
    }

    fn read_bool(&self, subgroup: &str, key: &str, default: bool) -> bool {
        match self.get(subgroup, key) {
            Some(Value::Boolean(b)) => *b,
            // INI heritage: integers still count as booleans
            Some(Value::Integer(n)) => *n != 0,
            _ => default,
        }
    }

    fn write_str(&mut self, subgroup: &str, key: &str, value: &str) {
        self.subgroup_table_mut(subgroup)
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    fn write_int(&mut self, subgroup: &str, key: &str, value: i64) {
        self.subgroup_table_mut(subgroup)
            .insert(key.to_string(), Value::Integer(value));
    }

    fn write_bool(&mut self, subgroup: &str, key: &str, value: bool) {
        self.subgroup_table_mut(subgroup)
            .insert(key.to_string(), Value::Boolean(value));
    }
}
