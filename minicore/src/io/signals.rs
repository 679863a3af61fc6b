//! OS signal handling for headless runs.
//!
//! SIGINT and SIGTERM (Ctrl-C off unix) feed an [`Interrupt`]: the first asks
//! the loop to stop, the second forces in-flight commands to be killed. The
//! listener runs on its own thread with a single-threaded tokio runtime so the
//! agent loop itself stays synchronous.

use std::thread;

use anyhow::{Context, Result};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use crate::interrupt::Interrupt;

/// Start listening for interrupt signals for the rest of the process.
pub fn install(interrupt: Interrupt) -> Result<()> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let listener = Listener::register(&runtime)?;
    thread::Builder::new()
        .name("mini-signals".to_string())
        .spawn(move || runtime.block_on(listener.run(interrupt)))
        .context("spawn signal thread")?;
    debug!("signal listener installed");
    Ok(())
}

#[cfg(unix)]
struct Listener {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listener {
    fn register(runtime: &Runtime) -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let _guard = runtime.enter();
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).context("register SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).context("register SIGTERM handler")?,
        })
    }

    async fn run(mut self, interrupt: Interrupt) {
        loop {
            let name = tokio::select! {
                received = self.sigint.recv() => received.map(|()| "SIGINT"),
                received = self.sigterm.recv() => received.map(|()| "SIGTERM"),
            };
            let Some(name) = name else {
                return;
            };
            interrupt.signal();
            if interrupt.is_forced() {
                warn!(signal = name, "second interrupt, killing running command");
            } else {
                warn!(signal = name, "interrupt received, stopping after the current call");
            }
        }
    }
}

#[cfg(not(unix))]
struct Listener;

#[cfg(not(unix))]
impl Listener {
    fn register(_runtime: &Runtime) -> Result<Self> {
        Ok(Self)
    }

    async fn run(self, interrupt: Interrupt) {
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupt.signal();
            if interrupt.is_forced() {
                warn!("second interrupt, killing running command");
            } else {
                warn!("interrupt received, stopping after the current call");
            }
        }
    }
}
