use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Claim, UnitRegistry};
use crate::clock::Clock;
use crate::error::StageError;

/// Keeps a claim alive while a stage works through its frames.
///
/// `checkpoint` is called between frames: it renews the lease once half of it
/// has elapsed and turns a shutdown request into `StageError::Cancelled`, so the
/// caller abandons the claim instead of completing it.
pub struct LeaseKeeper {
    registry: Arc<dyn UnitRegistry>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    claim: Claim,
    lease: Duration,
}

impl LeaseKeeper {
    pub fn new(
        registry: Arc<dyn UnitRegistry>,
        clock: Arc<dyn Clock>,
        shutdown: Arc<AtomicBool>,
        claim: Claim,
        lease: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            shutdown,
            claim,
            lease,
        }
    }

    pub fn claim(&self) -> &Claim {
        &self.claim
    }

    pub fn into_claim(self) -> Claim {
        self.claim
    }

    pub fn checkpoint(&mut self) -> Result<(), StageError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(StageError::Cancelled);
        }
        let half_lease_us = i64::try_from(self.lease.as_micros() / 2).unwrap_or(i64::MAX);
        let renew_at = self.claim.lease_expires_us.saturating_sub(half_lease_us);
        if self.clock.now_us() >= renew_at {
            self.registry.renew(&mut self.claim, self.lease)?;
        }
        Ok(())
    }
}
