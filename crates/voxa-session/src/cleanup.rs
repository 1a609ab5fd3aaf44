//! Teardown of live session resources
//!
//! Every exit path (user stop, remote close, start failure, engine error)
//! funnels through [`SessionResources::teardown`]. The bundle holds each
//! resource in an `Option` so a second teardown finds nothing left to do,
//! and failures in one step are logged without skipping the rest.

use crate::capture::CaptureHandle;
use crate::playback::PlaybackScheduler;
use crate::transport::TransportAdapter;
use tracing::debug;

/// The live resources a running session owns. Fields are `None` once torn
/// down (or never acquired: the managed-room path has no scheduler).
pub struct SessionResources {
    pub capture: Option<CaptureHandle>,
    pub transport: Option<TransportAdapter>,
    pub scheduler: Option<PlaybackScheduler>,
}

impl SessionResources {
    pub fn empty() -> Self {
        Self {
            capture: None,
            transport: None,
            scheduler: None,
        }
    }

    /// Tear everything down, in order: cancel pending playback, stop
    /// capture, disconnect the transport, release the output engine.
    /// Idempotent; never fails.
    pub async fn teardown(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.cancel_pending();
        }
        if self.capture.take().is_some() {
            debug!("capture stopped");
        }
        if let Some(mut transport) = self.transport.take() {
            // Disconnect logs its own failures; none of them propagate.
            transport.disconnect().await;
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.release_sink();
            debug!("output engine released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionTunables;
    use crate::sink::ManualSink;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (sink, probe) = ManualSink::new(tx, false);
        let mut resources = SessionResources {
            capture: None,
            transport: None,
            scheduler: Some(PlaybackScheduler::new(
                SessionTunables::default(),
                Box::new(sink),
            )),
        };

        resources.teardown().await;
        assert!(probe.released());
        assert_eq!(probe.hard_stops(), 1);

        // Second pass finds nothing to do.
        resources.teardown().await;
        assert_eq!(probe.hard_stops(), 1);
    }
}
