use lib_telemetry::{ConsumerView, LinkState};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Logs link state transitions and warns once per stale episode when no
/// snapshot has been captured for longer than `stale_after`.
pub async fn run(
    view: ConsumerView,
    mut link: watch::Receiver<LinkState>,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    let mut check_interval = interval(stale_after.max(Duration::from_secs(1)) / 2);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stale = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Monitor received shutdown signal.");
                break;
            }
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *link.borrow_and_update();
                info!(link = %state, "bus link state changed");
                if state == LinkState::Terminated {
                    break;
                }
            }
            _ = check_interval.tick() => {
                let now_stale = is_stale(&view, stale_after);
                if now_stale && !stale {
                    warn!(
                        stale_after_secs = stale_after.as_secs(),
                        snapshots = view.history_len(),
                        "waiting for data: no new snapshot within threshold"
                    );
                } else if !now_stale && stale {
                    info!("data flowing again");
                }
                stale = now_stale;
            }
        }
    }
}

/// No snapshot yet, or the newest one is older than `stale_after`.
pub fn is_stale(view: &ConsumerView, stale_after: Duration) -> bool {
    match view.last_snapshot_age() {
        Some(age) => age.to_std().is_ok_and(|age| age > stale_after),
        None => true,
    }
}
