use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use message_bus::{BusResult, CommandBus, Message, Subscriber};
use tracing::{debug, warn};

use crate::adapter::BusAdapter;
use crate::config::BridgeConfig;

/// Joins two buses so traffic published on either shows up once on the other.
///
/// Each adapter listens on its own bus with the opposite adapter as handler.
/// Commands cross with single-claimant delivery; everything else is
/// republished as a broadcast.
pub struct BusConnector<L, R = L>
where
    L: CommandBus + 'static,
    R: CommandBus + 'static,
{
    left: Arc<BusAdapter<L>>,
    right: Arc<BusAdapter<R>>,
    disposed: AtomicBool,
}

impl<L, R> BusConnector<L, R>
where
    L: CommandBus + 'static,
    R: CommandBus + 'static,
{
    pub fn new(left: Arc<L>, right: Arc<R>, config: BridgeConfig) -> BusResult<Self> {
        let left = Arc::new(BusAdapter::new(left, config.tracked_capacity));
        let right = Arc::new(BusAdapter::new(right, config.tracked_capacity));

        left.subscribe::<dyn Message, _>(Arc::clone(&right))?.detach();
        match right.subscribe::<dyn Message, _>(Arc::clone(&left)) {
            Ok(subscription) => subscription.detach(),
            Err(err) => {
                let _ = left.unsubscribe::<dyn Message, _>(&right);
                return Err(err);
            }
        }
        debug!(
            target = "bus_connector",
            left = %left.bus().bus_name(),
            right = %right.bus().bus_name(),
            tracked_capacity = config.tracked_capacity,
            "buses connected"
        );
        Ok(Self {
            left,
            right,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn left(&self) -> &Arc<BusAdapter<L>> {
        &self.left
    }

    pub fn right(&self) -> &Arc<BusAdapter<R>> {
        &self.right
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stops forwarding in both directions: the left adapter leaves the right
    /// bus first, then the right adapter leaves the left bus.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.right.unsubscribe::<dyn Message, _>(&self.left) {
            warn!(
                target = "bus_connector",
                bus = %self.right.bus().bus_name(),
                error = %err,
                "failed to detach left adapter"
            );
        }
        if let Err(err) = self.left.unsubscribe::<dyn Message, _>(&self.right) {
            warn!(
                target = "bus_connector",
                bus = %self.left.bus().bus_name(),
                error = %err,
                "failed to detach right adapter"
            );
        }
        debug!(
            target = "bus_connector",
            left = %self.left.bus().bus_name(),
            right = %self.right.bus().bus_name(),
            "buses disconnected"
        );
    }
}

impl<L, R> Drop for BusConnector<L, R>
where
    L: CommandBus + 'static,
    R: CommandBus + 'static,
{
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<L, R> std::fmt::Debug for BusConnector<L, R>
where
    L: CommandBus + 'static,
    R: CommandBus + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnector")
            .field("left", &self.left.bus().bus_name())
            .field("right", &self.right.bus().bus_name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
