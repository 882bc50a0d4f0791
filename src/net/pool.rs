use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rand::Rng;

/// Bounded pool over a closed port interval. Fairness is unimportant;
/// `acquire` retries are bounded by the pool capacity.
pub struct PortPool {
    inner: Mutex<Inner>,
}

struct Inner {
    min: u16,
    max: u16,
    allocated: HashSet<u16>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Result<Self> {
        if min == 0 || min > max {
            return Err(anyhow!("invalid port range {}-{}", min, max));
        }
        Ok(PortPool {
            inner: Mutex::new(Inner {
                min,
                max,
                allocated: HashSet::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        (inner.max - inner.min) as usize + 1
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().unwrap().allocated.len()
    }

    /// Hands out `requested` when it is free and in range, otherwise a
    /// uniformly random free port. Fails when the range is exhausted.
    pub fn acquire(&self, requested: Option<u16>) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(port) = requested {
            if port >= inner.min && port <= inner.max && inner.allocated.insert(port) {
                return Ok(port);
            }
        }

        let capacity = (inner.max - inner.min) as usize + 1;
        if inner.allocated.len() >= capacity {
            return Err(anyhow!(
                "port range {}-{} exhausted",
                inner.min,
                inner.max
            ));
        }

        let mut rng = rand::thread_rng();
        for _ in 0..capacity {
            let port = rng.gen_range(inner.min..=inner.max);
            if inner.allocated.insert(port) {
                return Ok(port);
            }
        }
        // Random probing missed; sweep for the free slot that must exist.
        for port in inner.min..=inner.max {
            if inner.allocated.insert(port) {
                return Ok(port);
            }
        }
        Err(anyhow!("port range {}-{} exhausted", inner.min, inner.max))
    }

    /// Releasing a port that was never handed out is a no-op.
    pub fn release(&self, port: u16) {
        self.inner.lock().unwrap().allocated.remove(&port);
    }
}
