//! Control signals, whether raised by the OS or pushed through the store.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown signal '{0}'")]
pub struct UnknownSignal(pub String);

/// What a signal asks the launcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// `TSTP` / `USR1`: stop fetching new work.
    Quiet,
    /// `TERM` / `INT`: shut down.
    Stop,
    /// `TTIN` / `USR2`: log the in-flight work.
    DumpWork,
}

impl Signal {
    /// Name written to `<identity>-signals` for a remote delivery.
    pub fn as_remote(&self) -> &'static str {
        match self {
            Signal::Quiet => "TSTP",
            Signal::Stop => "TERM",
            Signal::DumpWork => "TTIN",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Quiet => write!(f, "quiet"),
            Signal::Stop => write!(f, "stop"),
            Signal::DumpWork => write!(f, "dump"),
        }
    }
}

/// Accepts OS names (`TSTP`, `SIGTERM`, ...) and the CLI words
/// `quiet`/`stop`/`dump`, case-insensitively.
impl FromStr for Signal {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TSTP" | "USR1" | "QUIET" => Ok(Signal::Quiet),
            "TERM" | "INT" | "STOP" => Ok(Signal::Stop),
            "TTIN" | "USR2" | "DUMP" => Ok(Signal::DumpWork),
            _ => Err(UnknownSignal(s.to_string())),
        }
    }
}

/// Where the heartbeat hands signals popped from the store.
pub trait SignalDelivery: Send + Sync {
    fn deliver(&self, signal: Signal);
}

/// Forwards signals into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    tx: mpsc::UnboundedSender<Signal>,
}

impl ChannelDelivery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalDelivery for ChannelDelivery {
    fn deliver(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            debug!(%signal, "Signal receiver dropped");
        }
    }
}

/// Drops every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreSignals;

impl SignalDelivery for IgnoreSignals {
    fn deliver(&self, signal: Signal) {
        debug!(%signal, "Ignoring signal");
    }
}
