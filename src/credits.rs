//! Controller ACL credit accounting, split between the host and the proxy.
//!
//! The controller advertises one transmit budget per transport. The proxy
//! skims a configured share off that budget before the host ever sees it;
//! the rest is passed through. One [`Credits`] instance tracks the skimmed
//! share for one transport.

use crate::Error;

/// Transmit-credit pool for a single transport.
pub(crate) struct Credits {
    /// How many credits the proxy would like to take for itself.
    to_reserve: u16,
    /// How many the proxy actually obtained from the controller.
    proxy_max: u16,
    /// How many sent packets the controller still owes completions for.
    proxy_pending: u16,
}

impl Credits {
    pub const fn new(to_reserve: u16) -> Self {
        Self {
            to_reserve,
            proxy_max: 0,
            proxy_pending: 0,
        }
    }

    /// Splits the controller's budget between the proxy and the host.
    ///
    /// Takes `min(controller_max, to_reserve)` for the proxy and returns
    /// the remainder, which the caller passes on to the host in the
    /// rewritten buffer-size event. Must not be called again until
    /// [`Credits::reset`] has run.
    pub fn reserve(&mut self, controller_max: u16) -> u16 {
        assert!(
            !self.initialized(),
            "credit pool is already initialized, reset the proxy first"
        );

        self.proxy_max = controller_max.min(self.to_reserve);
        let host_max = controller_max - self.proxy_max;

        info!(
            "[credits] reserved {} ACL credits, passed {} on to host",
            self.proxy_max, host_max
        );
        if self.proxy_max < self.to_reserve {
            error!(
                "[credits] only {} of the configured {} credits were available from the controller's {}",
                self.proxy_max, self.to_reserve, controller_max
            );
        }

        host_max
    }

    /// Accounts for `count` packets about to be sent to the controller.
    pub fn mark_pending(&mut self, count: u16) -> Result<(), Error> {
        if count > self.available() {
            return Err(Error::NoCredits);
        }
        self.proxy_pending += count;
        Ok(())
    }

    /// Accounts for `count` packets the controller finished processing.
    pub fn mark_completed(&mut self, count: u16) {
        if count > self.proxy_pending {
            error!("[credits] controller completed more packets than were pending");
            self.proxy_pending = 0;
        } else {
            self.proxy_pending -= count;
        }
    }

    pub fn reset(&mut self) {
        self.proxy_max = 0;
        self.proxy_pending = 0;
    }

    pub fn available(&self) -> u16 {
        self.proxy_max - self.proxy_pending
    }

    pub fn has_send_capability(&self) -> bool {
        self.proxy_max > 0
    }

    pub fn initialized(&self) -> bool {
        self.proxy_max > 0 || self.proxy_pending > 0
    }
}
