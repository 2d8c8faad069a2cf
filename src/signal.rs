//! OS signals that end a live set.
//!
//! A set must be ended on the relay before the process goes away, or
//! listeners keep seeing the last track until the relay expires the set.
//! Ctrl-C is handled everywhere; on Unix, SIGTERM (service managers) and
//! SIGHUP (closed terminal) are handled as well.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[expect(clippy::module_name_repetitions)]
pub enum ShutdownSignal {
    /// Ctrl-C or SIGINT.
    Interrupt,
    Terminate,
    Hangup,
}

/// Waits for shutdown signals.
pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
}

impl Handler {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a handler cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                _ = self.sigterm.recv() => ShutdownSignal::Terminate,
                _ = self.sighup.recv() => ShutdownSignal::Hangup,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "Ctrl+C"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Hangup => write!(f, "SIGHUP"),
        }
    }
}
