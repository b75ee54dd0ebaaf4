mod cli;
mod dispatcher;
mod logging;
mod staging;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::Context;
use clap::Parser;

use dicl_index::PersistentIndex;
use dicl_log::LogPool;
use dicl_rdma::ServerContext;
use dicl_wire::{INDEX_SIZE, LOG_SIZE};

use crate::cli::Args;
use crate::dispatcher::Dispatcher;
use crate::logging::{init_logging, LogArgs};
use crate::staging::StagingTable;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&LogArgs {
        level: args.effective_log_level(),
        format: args.log.format,
    });

    if let Err(e) = run(args) {
        tracing::error!(error = ?e, "dicl-server exiting with error");
        std::process::exit(1);
    }
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.path)
        .with_context(|| format!("creating mount path {}", args.path.display()))?;

    let log = Arc::new(
        LogPool::open_or_create(args.path.join("log"), LOG_SIZE).context("opening log pool")?,
    );
    let index = Arc::new(
        PersistentIndex::open_or_create(args.path.join("pmem"), INDEX_SIZE, 1024 * 16 * 4)
            .context("opening index pool")?,
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        // SAFETY: the registered closure only stores into an AtomicBool, which is
        // async-signal-safe; it performs no allocation and calls nothing else.
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
                running.store(false, Ordering::Release);
            })
        }
        .context("installing SIGINT handler")?;
    }

    if !args.rdma {
        tracing::warn!("starting without RDMA transport (--rdma not set); persistence layer only");
        while running.load(Ordering::Acquire) {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
        return Ok(());
    }

    let transport = Arc::new(ServerContext::open(args.ib_port, None).context("bringing up RDMA provider")?);
    let staging = Arc::new(StagingTable::new());
    let (tx, rx) = mpsc::channel();

    let dispatcher = Dispatcher {
        transport: Arc::clone(&transport),
        log: Arc::clone(&log),
        index: Arc::clone(&index),
        staging: Arc::clone(&staging),
    };
    let dispatcher_handle = std::thread::spawn(move || dispatcher.run(rx));

    let poller_handle = {
        let transport = Arc::clone(&transport);
        let staging = Arc::clone(&staging);
        std::thread::spawn(move || {
            if let Err(e) = dicl_rdma::run_poller(transport, tx, staging) {
                tracing::error!(error = %e, "completion poller terminated");
                std::process::exit(1);
            }
        })
    };

    let bootstrap_result = dicl_rdma::run_bootstrap(args.tcp_port, Arc::clone(&transport), Arc::clone(&running));

    // The bootstrap listener only returns on clean shutdown or a fatal provider error; either
    // way there is nothing further for the poller/dispatcher threads to do once it's gone, since
    // no new clients can be bootstrapped and the process is on its way out.
    bootstrap_result.context("bootstrap listener failed")?;

    drop(poller_handle);
    drop(dispatcher_handle);
    Ok(())
}
