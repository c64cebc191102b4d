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

    main.rs

    Wang 2200 terminal server: connects physical Wang 2236/2336 terminals
    on host serial ports to the emulated MXD terminal multiplexer.

    The main thread drives the emulation; each open serial port runs one
    receive thread; a control thread turns stdin commands (status, reload,
    quit) into messages the main loop drains between scheduler slices.
*/

mod config;

use std::{
    fs::OpenOptions,
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use bpaf::Bpaf;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use wangmux_core::{
    bus::NullSystem,
    devices::termmux::TermMuxCard,
    machine::Machine,
    scheduler::timer_ms,
    serial::{CaptureCallback, SerialPort},
    session::SerialTermSession,
    termcfg::{TermMuxCfg, TerminalCfg},
};

use crate::config::TomlConfigStore;

/// Emulation slice and poll cadence.
const SLICE_MS: u64 = 30;

/// Session statistics are logged this often.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Terminals whose device was absent or failed to open are retried this
/// often. Distinct from the port's own reconnect backoff, which covers an
/// already-open device going away.
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the per-terminal queue from the receive thread.
const RX_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version, generate(cli_args))]
/// Wang 2200 terminal server
struct CmdLineArgs {
    /// Configuration file (TOML)
    #[bpaf(long, argument("PATH"))]
    configfile: Option<PathBuf>,

    /// Backplane slot holding the MXD card
    #[bpaf(long, argument("SLOT"))]
    slot: Option<usize>,

    /// Write per-terminal byte capture files into this directory
    #[bpaf(long, argument("DIR"))]
    capture_dir: Option<PathBuf>,
}

enum ControlMsg {
    Status,
    Reload,
    Quit,
}

fn main() {
    env_logger::init();
    if let Err(e) = run(cli_args().run()) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: CmdLineArgs) -> anyhow::Result<()> {
    log::info!("Wang 2200 terminal server starting");

    let config_path = args
        .configfile
        .unwrap_or_else(|| PathBuf::from("wangmux.toml"));
    let slot = args.slot.unwrap_or(2);
    let subgroup = TermMuxCfg::subgroup(slot);

    let mut store = TomlConfigStore::load(&config_path)?;
    let cfg = TermMuxCfg::load(&store, &subgroup);

    let capture_dir: Option<PathBuf> = args.capture_dir.or_else(|| {
        use wangmux_core::termcfg::ConfigStore;
        let dir = store.read_str("terminal_server", "capture_dir", "");
        if dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(dir))
        }
    });

    log::info!("MXD in slot {}: {} terminal(s)", slot, cfg.num_terminals());
    for n in 0..cfg.num_terminals() {
        let term = cfg.terminal(n);
        if term.has_com_port() {
            log::info!("  terminal {}: {}", n, term.to_serial_config().describe());
        } else {
            log::info!("  terminal {}: no port configured", n);
        }
    }

    let card = TermMuxCard::new(0x00, cfg.clone(), Box::new(NullSystem::new()));
    let mut machine = Machine::new(card);

    for n in 0..cfg.num_terminals() {
        let term = cfg.terminal(n);
        if term.has_com_port() {
            wire_terminal(&mut machine, n, term, capture_dir.as_deref());
        }
    }

    let (control_tx, control_rx) = bounded::<ControlMsg>(8);
    spawn_control_thread(control_tx);

    log::info!("emulation running; commands: status, reload, quit");

    let mut running = true;
    let mut last_wall = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_retry = Instant::now();

    while running {
        // Fold bytes from the receive threads into the UART FIFOs, then
        // advance the emulation by the wall time that actually passed.
        machine.poll_endpoints();

        let now = Instant::now();
        let delta_ns = (now - last_wall).as_nanos().min(timer_ms(50) as u128) as u64;
        last_wall = now;
        machine.run_for(delta_ns);

        if last_stats.elapsed() >= STATS_INTERVAL {
            log_session_stats(&machine);
            last_stats = Instant::now();
        }

        if last_retry.elapsed() >= RETRY_INTERVAL {
            retry_terminals(&mut machine, capture_dir.as_deref());
            last_retry = Instant::now();
        }

        // Single wait point: the next timer deadline, capped at one slice,
        // interruptible by control messages.
        let sleep_ms = machine.ms_until_next().unwrap_or(SLICE_MS).clamp(1, SLICE_MS);
        match control_rx.recv_timeout(Duration::from_millis(sleep_ms)) {
            Ok(ControlMsg::Quit) => running = false,
            Ok(ControlMsg::Status) => print_status(&machine),
            Ok(ControlMsg::Reload) => {
                match reload(&mut machine, &config_path, &subgroup, capture_dir.as_deref()) {
                    Ok(new_store) => store = new_store,
                    Err(e) => log::error!("reload failed: {:#}", e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => running = false,
        }
    }

    log::info!("shutting down");
    machine.card().cfg().save(&mut store, &subgroup);
    if let Err(e) = store.save() {
        log::warn!("could not persist configuration: {:#}", e);
    }

    // Dropping the machine flushes every TX queue and closes the ports.
    drop(machine);
    log::info!("shutdown complete");
    Ok(())
}

/// Open the configured device for terminal `n` and bind a session to the
/// MXD channel. Returns false if the device is absent or refuses to open;
/// the retry sweep will try again later.
fn wire_terminal(
    machine: &mut Machine,
    n: usize,
    term: &TerminalCfg,
    capture_dir: Option<&Path>,
) -> bool {
    let serial_cfg = term.to_serial_config();

    if !Path::new(&serial_cfg.port_name).exists() {
        log::warn!(
            "serial device {} does not exist, terminal {} left unconnected",
            serial_cfg.port_name,
            n
        );
        return false;
    }

    let port = SerialPort::new();
    if !port.open(&serial_cfg) {
        log::warn!(
            "failed to open {} for terminal {}, will retry",
            serial_cfg.port_name,
            n
        );
        return false;
    }

    if let Some(dir) = capture_dir {
        match capture_callback(n, dir) {
            Ok(cb) => {
                port.set_capture_callback(Some(cb));
                log::info!("terminal {} capture enabled in {}", n, dir.display());
            }
            Err(e) => log::warn!("terminal {} capture disabled: {:#}", n, e),
        }
    }

    // Terminal-to-MXD path: the session's receive callback feeds a bounded
    // queue drained on the emulation thread.
    let (tx, rx) = bounded::<u8>(RX_QUEUE_CAPACITY);
    let session = SerialTermSession::new(
        Arc::clone(&port),
        Arc::new(move |byte| {
            let _ = tx.try_send(byte);
        }),
    );
    machine.card_mut().attach_session(n, Box::new(session), rx);
    true
}

/// Per-direction capture files, one pair per terminal.
fn capture_callback(n: usize, dir: &Path) -> anyhow::Result<CaptureCallback> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating capture directory {}", dir.display()))?;

    let open = |suffix: &str| {
        let path = dir.join(format!("term{}_{}.log", n, suffix));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening capture file {}", path.display()))
    };
    let files = Mutex::new((open("rx")?, open("tx")?));

    Ok(Arc::new(move |byte, is_rx| {
        let mut files = files.lock().unwrap();
        let file = if is_rx { &mut files.0 } else { &mut files.1 };
        let _ = file.write_all(&[byte]);
        let _ = file.flush();
    }))
}

fn spawn_control_thread(tx: Sender<ControlMsg>) {
    let result = std::thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                let msg = match line.trim() {
                    "" => continue,
                    "status" => ControlMsg::Status,
                    "reload" => ControlMsg::Reload,
                    "quit" | "exit" => ControlMsg::Quit,
                    other => {
                        log::warn!("unknown command '{}' (status, reload, quit)", other);
                        continue;
                    }
                };
                let quitting = matches!(msg, ControlMsg::Quit);
                if tx.send(msg).is_err() || quitting {
                    break;
                }
            }
            // stdin closed: treat like quit
            let _ = tx.send(ControlMsg::Quit);
        });

    if let Err(e) = result {
        log::warn!("control thread unavailable: {}", e);
    }
}

/// JSON status snapshot on stdout, one object with one entry per terminal.
fn print_status(machine: &Machine) {
    let card = machine.card();
    let terminals: Vec<serde_json::Value> = (0..card.num_terminals())
        .map(|n| {
            let active = card.is_endpoint_active(n);
            let mut entry = serde_json::json!({ "id": n, "active": active });
            if let Some((rx, tx)) = card.endpoint_stats(n) {
                entry["rx_bytes"] = rx.into();
                entry["tx_bytes"] = tx.into();
            }
            if let Some(desc) = card.endpoint_description(n) {
                entry["description"] = desc.into();
            }
            entry
        })
        .collect();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let status = serde_json::json!({
        "timestamp": timestamp,
        "status": "running",
        "terminals": terminals,
    });
    println!("{}", status);
}

fn log_session_stats(machine: &Machine) {
    let card = machine.card();
    for n in 0..card.num_terminals() {
        if let Some((rx, tx)) = card.endpoint_stats(n) {
            log::info!("terminal {}: rx={} tx={} bytes", n, rx, tx);
        }
    }
}

/// Bring up terminals that are configured but not currently connected.
fn retry_terminals(machine: &mut Machine, capture_dir: Option<&Path>) {
    let cfg = machine.card().cfg().clone();
    for n in 0..cfg.num_terminals() {
        let term = cfg.terminal(n);
        if term.has_com_port() && !machine.card().is_endpoint_active(n) {
            log::info!("retrying terminal {} on {}", n, term.com_port);
            wire_terminal(machine, n, term, capture_dir);
        }
    }
}

/// Re-read the configuration file and apply it. A change to the channel
/// count or any terminal wiring rebuilds the sessions.
fn reload(
    machine: &mut Machine,
    config_path: &Path,
    subgroup: &str,
    capture_dir: Option<&Path>,
) -> anyhow::Result<TomlConfigStore> {
    let store = TomlConfigStore::load(config_path)?;
    let new_cfg = TermMuxCfg::load(&store, subgroup);

    if new_cfg.needs_reboot(machine.card().cfg()) {
        log::info!("configuration changed, rewiring terminals");
        for n in 0..wangmux_core::termcfg::MAX_TERMINALS {
            machine.card_mut().detach_endpoint(n);
        }
        machine.card_mut().set_configuration(new_cfg.clone());
        for n in 0..new_cfg.num_terminals() {
            let term = new_cfg.terminal(n);
            if term.has_com_port() {
                wire_terminal(machine, n, term, capture_dir);
            }
        }
    } else {
        log::info!("configuration unchanged");
    }

    Ok(store)
}
