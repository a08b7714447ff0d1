//! Staggered launch scheduling.
//!
//! Bot `i` is due `interval * i` after fleet start. Every delayed bot gets its
//! own timer task which posts `Event::LaunchDue` when it fires, so a slow or
//! failing launch never holds up another one.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::FleetError;
use crate::events::Event;

/// Delay before bot `index` is launched.
pub fn launch_delay(index: usize, interval: Option<Duration>) -> Duration {
    match interval {
        Some(interval) => interval * index as u32,
        None => Duration::ZERO,
    }
}

/// Checks that the last bot's delay is representable.
pub fn validate_interval(size: usize, interval_ms: Option<u64>) -> Result<Option<Duration>, FleetError> {
    let Some(ms) = interval_ms else {
        return Ok(None);
    };
    let last = size.saturating_sub(1) as u64;
    if u32::try_from(size).is_err() || ms.checked_mul(last).is_none() {
        return Err(FleetError::InvalidStagger(format!(
            "{}ms x {} bots overflows",
            ms, size
        )));
    }
    Ok(Some(Duration::from_millis(ms)))
}

/// Schedules every bot in `0..size`.
///
/// Returns the indices due right now, in order; the caller launches those
/// inline. Everything else arrives later as `Event::LaunchDue`.
pub fn schedule_all(
    size: usize,
    interval: Option<Duration>,
    tx: &mpsc::Sender<Event>,
) -> Vec<usize> {
    let mut due_now = Vec::new();
    for index in 0..size {
        let delay = launch_delay(index, interval);
        if delay.is_zero() {
            due_now.push(index);
            continue;
        }
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::LaunchDue { index }).await;
        });
    }
    due_now
}
