use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pingtun::cli::Args;
use pingtun::config::Config;
use pingtun::keepalive::Keepalive;
use pingtun::linux::{IcmpSocketV4, TunDevice};
use pingtun::relay::{Relay, RelayOptions};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over -d
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .ok();

    let config = Config::load(&args.config, |config| args.apply(config))?;

    if args.check {
        println!("{}: configuration ok", args.config.display());
        return Ok(());
    }

    let state = config.role_state()?;
    info!(
        role = %config.role,
        remote = ?config.remote,
        mtu = config.mtu,
        keepalive = config.keepalive_active(),
        interval_ms = config.keepalive.interval_ms,
        "startup"
    );

    let tun = TunDevice::open(&config.dev, config.mtu)?;
    let icmp = IcmpSocketV4::sender()?;
    let divert = IcmpSocketV4::divert()?;
    info!(dev = tun.name(), "devices ready");

    let keepalive = if config.keepalive_active() {
        Keepalive::new(config.keepalive.interval())
    } else {
        Keepalive::disabled()
    };

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        cancel_clone.cancel();
    });

    let mut relay = Relay::new(tun, icmp, divert, state, RelayOptions::from(&config), keepalive);
    if let Err(e) = relay.run(&cancel).await {
        error!(operation = e.operation(), "fatal: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
