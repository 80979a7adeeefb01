//! Bounded polling with exponential backoff.
//!
//! Used wherever the pipeline has to wait for something outside its control:
//! a domain reaching a state, a DHCP lease appearing, sshd accepting
//! connections, a guest coming back from reboot.

use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First sleep between attempts.
    pub initial: Duration,
    /// Sleeps double up to this cap.
    pub max: Duration,
    /// Give up once this much time has passed.
    pub timeout: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, timeout: Duration) -> Self {
        Self {
            initial,
            max,
            timeout,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Call `probe` until it yields `Some`, sleeping with exponential backoff
/// between attempts.
///
/// Errors from `probe` abort the wait immediately. Running out of time fails
/// with [`PipelineError::Timeout`].
pub fn poll_until<T, F>(what: &str, backoff: Backoff, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut delay = backoff.initial;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = probe()? {
            tracing::debug!(what, attempt, elapsed = ?start.elapsed(), "ready");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= backoff.timeout {
            return Err(PipelineError::Timeout {
                what: what.to_string(),
                waited: elapsed,
            }
            .into());
        }

        let sleep = delay.min(backoff.timeout - elapsed);
        tracing::debug!(what, attempt, ?sleep, "not ready; backing off");
        std::thread::sleep(sleep);
        delay = backoff.next_delay(delay);
    }
}

/// Whether a TCP connection to `addr` succeeds within `timeout`.
pub fn port_open(addr: SocketAddr, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}
