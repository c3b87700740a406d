//! airmeshd: drives the backhaul reconcilers over the state store.

mod config;
mod replay;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use airmesh_backhaul::Backhaul;
use airmesh_store::Store;

use crate::config::DaemonConfig;

#[derive(Debug, Parser)]
#[command(name = "airmeshd", about = "Backhaul connection-manager daemon")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Space-separated phy:vif bootstrap list (overrides config).
    #[arg(long)]
    bootstrap: Option<String>,

    /// Newline-delimited JSON store rows to feed on startup.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Exit once the reconcilers quiesce instead of waiting for input.
    #[arg(long)]
    oneshot: bool,
}

struct Daemon {
    store: Store,
    backhaul: Backhaul,
    started: Instant,
}

impl Daemon {
    fn new(config: &DaemonConfig) -> Self {
        Self {
            store: Store::new(),
            backhaul: Backhaul::from_list(&config.bootstrap, config.gre_mtu),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Dispatch pending store events and run due recalcs until the next
    /// wakeup is in the future (or nothing is scheduled).
    async fn settle(&mut self) {
        loop {
            let now = self.now_ms();
            let events = self.store.drain_events();
            for ev in &events {
                self.backhaul.dispatch(ev, now);
            }
            self.backhaul.poll(now, &mut self.store);
            if self.store.has_events() {
                continue;
            }
            match self.backhaul.next_wakeup() {
                Some(at) if at > now => {
                    tokio::time::sleep(Duration::from_millis(at - now)).await;
                }
                Some(_) => continue,
                None => break,
            }
        }
    }

    fn dump_uplinks(&self) {
        for row in self.store.uplinks() {
            info!(
                if_name = %row.if_name,
                if_type = row.if_type.as_deref().unwrap_or(""),
                has_l2 = row.has_l2.unwrap_or(false),
                has_l3 = row.has_l3.unwrap_or(false),
                "uplink"
            );
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(bootstrap) = args.bootstrap {
        config.bootstrap = bootstrap;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    info!(bootstrap = %config.bootstrap, gre_mtu = config.gre_mtu, "airmeshd starting");
    let mut daemon = Daemon::new(&config);

    if let Some(path) = &args.replay {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay file {}", path.display()))?;
        for (lineno, line) in content.lines().enumerate() {
            replay::apply_line(&mut daemon.store, line)
                .with_context(|| format!("replay line {}", lineno + 1))?;
            daemon.settle().await;
        }
        debug!("replay finished");
    }

    daemon.settle().await;
    daemon.dump_uplinks();

    if args.oneshot {
        info!("settled, exiting");
        return Ok(());
    }

    info!("settled, waiting for input (ctrl-c to exit)");
    tokio::signal::ctrl_c().await?;
    info!("airmeshd stopping");
    Ok(())
}
