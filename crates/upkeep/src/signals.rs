//! Signal port: translates process signals into machine events.
//!
//! `SIGUSR1` forces a deployment poll, `SIGUSR2` an inventory
//! submission; `SIGTERM`/`SIGINT`/`SIGQUIT` request a graceful stop.
//! Signals are forwarded into the machine's thread-safe event queue and
//! take effect when the event loop drains it.

use std::sync::mpsc::Sender;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::machine::ExternalEvent;

/// Handle to the installed signal listener; keep it alive for the
/// daemon's lifetime.
pub struct SignalPort {
    handle: signal_hook::iterator::Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Install the handlers and start forwarding into `sender`.
pub fn listen(sender: Sender<ExternalEvent>) -> Result<SignalPort> {
    let mut signals = Signals::new([SIGUSR1, SIGUSR2, SIGTERM, SIGINT, SIGQUIT])
        .context("failed to install signal handlers")?;
    let handle = signals.handle();

    let thread = std::thread::spawn(move || {
        for signal in signals.forever() {
            let event = match signal {
                SIGUSR1 => ExternalEvent::PollTriggered,
                SIGUSR2 => ExternalEvent::InventoryTriggered,
                _ => ExternalEvent::Terminate,
            };
            if sender.send(event).is_err() {
                break;
            }
        }
    });

    Ok(SignalPort {
        handle,
        thread: Some(thread),
    })
}

impl Drop for SignalPort {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
