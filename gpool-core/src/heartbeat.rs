use crate::metrics::RelayMetrics;
use crate::protocol::status_request;
use crate::upstream::UpstreamSender;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Send a `status` request upstream every `period`, starting one period from now, until
/// `scope` is cancelled. Send failures are logged and the schedule keeps going.
pub fn spawn_heartbeat(
    sender: UpstreamSender,
    scope: CancellationToken,
    period: Duration,
    metrics: RelayMetrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let request = match status_request() {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to encode status request, heartbeat disabled");
                return;
            }
        };

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    debug!("Heartbeat stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            // A full queue must not hold the task past cancellation
            tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    debug!("Heartbeat stopped while a status request was queued");
                    break;
                }
                sent = sender.send(request.clone()) => match sent {
                    Ok(()) => metrics.heartbeats_sent_total.inc(),
                    Err(e) => warn!(error = %e, "Failed to send status request"),
                },
            }
        }
    })
}
