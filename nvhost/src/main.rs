// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use nvhost_common::settings::BackendKind;
use nvhost_common::Errno;
use nvhost_core::host::Host;
use nvhost_core::job::{Gather, SyncptIncr};
use nvhost_core::opcodes::{self, SyncptCond};
use nvhost_service::abi::{self, SubmitArgs};
use nvhost_service::nvdrv::{DeviceTable, CTRL_PATH};

/// nvhost - host1x command submission core
#[derive(Parser, Debug)]
#[command(name = "nvhost", version, about = "Host1x syncpoint and channel submission driver")]
struct Args {
    /// Path to config file (default: $NVHOST_CONFIG or ~/.config/nvhost/nvhost.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend override: local or virtual
    #[arg(short, long)]
    backend: Option<String>,

    /// Number of concurrent clients in the workload
    #[arg(long, default_value_t = 2)]
    clients: u32,

    /// Jobs submitted by each client
    #[arg(long, default_value_t = 32)]
    jobs: u32,

    /// Gathers per job
    #[arg(long, default_value_t = 2)]
    gathers: u32,

    /// Dump the syncpoint table when done
    #[arg(long)]
    dump: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("nvhost - host1x submission core");

    let mut settings = config::load_config(args.config.as_ref());
    if let Some(backend) = &args.backend {
        settings.backend = BackendKind::from_str_or_default(backend);
    }
    if args.gathers == 0 || args.gathers > settings.max_gathers_per_job {
        bail!(
            "--gathers must be between 1 and {}",
            settings.max_gathers_per_job
        );
    }

    let host = Arc::new(Host::new(settings).context("failed to start host")?);
    info!("Backend: {}", host.backend_name());

    let started = Instant::now();
    let workers: Vec<_> = (0..args.clients)
        .map(|client| {
            let host = host.clone();
            let (jobs, gathers) = (args.jobs, args.gathers);
            thread::Builder::new()
                .name(format!("client-{client}"))
                .spawn(move || run_client(host, client, jobs, gathers))
                .context("failed to spawn client thread")
        })
        .collect::<Result<_>>()?;

    let mut total = 0;
    for worker in workers {
        match worker.join() {
            Ok(result) => total += result?,
            Err(_) => bail!("client thread panicked"),
        }
    }

    let elapsed = started.elapsed();
    info!(
        "Completed {} jobs from {} clients in {:?} ({:.0} jobs/s)",
        total,
        args.clients,
        elapsed,
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    if args.dump {
        host.syncpoints().debug_dump();
    }
    Ok(())
}

fn check(rc: i32, what: &str) -> Result<()> {
    let errno = Errno::from_return(rc);
    if !errno.is_success() {
        bail!("{what} failed: {errno}");
    }
    Ok(())
}

/// Submit `jobs` jobs through a channel device and wait for the last fence
/// on the ctrl device. Returns the number of jobs completed.
fn run_client(host: Arc<Host>, client: u32, jobs: u32, gathers: u32) -> Result<u32> {
    let mut table = DeviceTable::new(host.clone());
    let ctrl = table.open(CTRL_PATH)?;
    let gpu = table.open("/dev/nvhost-gpu")?;

    let mut out = [0u8; 64];
    let identifier = 0x1000 + client as u64;
    check(
        table.ioctl(gpu, abi::CHANNEL_OPEN, &identifier.to_le_bytes(), &mut out),
        "open channel",
    )?;
    check(
        table.ioctl(gpu, abi::CHANNEL_GET_SYNCPOINT, &0u32.to_le_bytes(), &mut out),
        "get syncpoint",
    )?;
    let id = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);

    // Every gather ends with one increment of the channel syncpoint.
    let memory = host.memory();
    let cmdbuf = memory.create(16)?;
    memory.write_words(
        cmdbuf,
        0,
        &[
            opcodes::nop(),
            opcodes::nonincr(opcodes::INCR_SYNCPT, 1),
            opcodes::incr_syncpt_payload(SyncptCond::OpDone, id),
        ],
    )?;
    let submit = SubmitArgs {
        gathers: (0..gathers).map(|_| Gather::new(cmdbuf, 3, 0)).collect(),
        incrs: vec![SyncptIncr {
            syncpt_id: id,
            incrs: gathers,
        }],
        ..Default::default()
    }
    .to_bytes()?;

    let mut last = None;
    for _ in 0..jobs {
        check(table.ioctl(gpu, abi::CHANNEL_SUBMIT, &submit, &mut out), "submit")?;
        last = abi::parse_fences(&out)?.pop();
    }

    if let Some((id, thresh)) = last {
        let mut wait = Vec::with_capacity(12);
        for word in [id, thresh, 5000] {
            wait.extend_from_slice(&word.to_le_bytes());
        }
        check(table.ioctl(ctrl, abi::CTRL_SYNCPT_WAIT, &wait, &mut out), "wait")?;
        info!(
            "client {}: syncpoint {} reached {}",
            client,
            id,
            u32::from_le_bytes([out[0], out[1], out[2], out[3]])
        );
    }

    table.close(gpu)?;
    table.close(ctrl)?;
    memory.destroy(cmdbuf)?;
    Ok(jobs)
}
