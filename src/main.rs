use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, never, unbounded};
use tracing::{error, info, warn};

use fitfarm::control::{self, ControlCommand};
use fitfarm::manager::{self, Manager};
use fitfarm::publisher::JsonlSink;
use fitfarm::{cli, config, logging};

/// Scan id used for the scan set up automatically in emulator mode.
const EMULATOR_SCAN_ID: u32 = 1;

fn main() -> Result<()> {
    let cli_opts = cli::parse();
    logging::init_logging(cli_opts.log_json);

    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let mut cfg = loaded.config;
    if let Some(threads) = cli_opts.fit_threads {
        cfg.fitter.threads = threads;
    }
    if let Some(port) = cli_opts.start_port {
        cfg.start_port = port;
    }
    cfg.emulator |= cli_opts.emulator;
    cfg.dump_network |= cli_opts.dump_network;

    let run_output_dir = cli_opts.output.join(&cfg.instance_id);
    info!(
        "starting instance_id={} config_hash={} output={} rods={:?} emulator={} fit_threads={}",
        cfg.instance_id,
        loaded.config_hash,
        run_output_dir.display(),
        cfg.rods,
        cfg.emulator,
        cfg.fitter.thread_count()
    );

    let sink = Arc::new(JsonlSink::new(&cfg.instance_id, &run_output_dir)?);
    let manager = Manager::start(&cfg, sink)?;
    for (unit, addr) in manager.endpoint_addrs() {
        info!("unit={unit} listening on {addr}");
    }

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing interrupt handler")?;

    if cfg.emulator {
        if let Some((_, crate_id, rod)) = cfg.rods.first().and_then(|r| manager::parse_rod_string(r)) {
            if let Err(err) = manager.setup_scan(EMULATOR_SCAN_ID, crate_id, rod, u32::MAX) {
                warn!("emulator scan setup failed: {err:#}");
            }
        }
    }

    let lines = spawn_control_reader();
    let idle = never::<String>();
    let mut feed_open = true;
    loop {
        let feed = if feed_open { &lines } else { &idle };
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => {
                info!("interrupt received, shutting down");
                break;
            }
            recv(feed) -> line => match line {
                Ok(line) => handle_line(&manager, &line),
                Err(_) if cfg.emulator => {
                    info!("control feed closed, running until interrupted");
                    feed_open = false;
                }
                Err(_) => {
                    info!("control feed closed, shutting down");
                    break;
                }
            }
        }
    }

    let stats = manager.shutdown()?;
    info!(
        "fitfarm finished scans_finished={} results_published={}",
        stats.scans_finished, stats.results_published
    );
    Ok(())
}

fn spawn_control_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("control feed read error: {err}");
                    break;
                }
            }
        }
    });
    rx
}

fn handle_line(manager: &Manager, line: &str) {
    match control::parse_line(line) {
        Ok(Some(ControlCommand::Start {
            crate_id,
            rod,
            scan_id,
            module_mask,
        })) => {
            if let Err(err) = manager.setup_scan(scan_id, crate_id, rod, module_mask) {
                error!("scan_id={scan_id} setup failed: {err:#}");
            }
        }
        Ok(Some(ControlCommand::Abort {
            crate_id,
            rod,
            scan_id,
        })) => manager.cancel_scan(scan_id, crate_id, rod),
        Ok(None) => {}
        Err(err) => warn!("ignoring control line {line:?}: {err}"),
    }
}
