// Licensed under the Apache-2.0 license

use anyhow::{bail, Result};
use std::time::{Duration, Instant};

/// Calls `f` every `interval` until it returns `Ok(true)`, it fails, or
/// `timeout` has elapsed.
pub fn poll_until<F>(timeout: Duration, interval: Duration, mut f: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    loop {
        if f()? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            bail!("timed out after {:?}", timeout);
        }
        std::thread::sleep(interval);
    }
}
