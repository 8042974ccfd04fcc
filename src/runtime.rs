// Fixed-period control loop with bounded catch-up
//
// One tick, in order: refresh the battery snapshot, update active drivebases,
// update every servo not owned by one. The tick itself never blocks beyond
// the transport's per-call I/O budget and never raises to foreground callers;
// tick-time faults are latched in per-motor state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::battery::BatteryMonitor;
use crate::config::CONTROL_LOOP_PERIOD;
use crate::error::Result;
use crate::registry::Hub;
use crate::transport::PassiveMode;

/// Next-wake calculator for the control loop.
///
/// Normally the deadline advances by exactly one period so the average rate
/// stays on target through occasional delays. If the loop has fallen more
/// than a full period behind, the deadline resets to now + period instead:
/// one late tick must not trigger a burst of catch-up ticks that saturates
/// the actuator bus.
#[derive(Debug, Clone, Copy)]
pub struct TickTimer {
    period: Duration,
    deadline: Instant,
}

impl TickTimer {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            period,
            deadline: start + period,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Advance past a completed tick, with bounded catch-up.
    pub fn advance(&mut self, now: Instant) -> Instant {
        self.deadline += self.period;
        if self.deadline <= now {
            self.deadline = now + self.period;
        }
        self.deadline
    }
}

/// Run the control loop until ctrl-c, then coast every attached actuator.
pub async fn run(hub: Arc<Hub>, battery: BatteryMonitor) -> Result<()> {
    tokio::select! {
        _ = control_loop(hub.clone(), battery) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    hub.stop_all(PassiveMode::Coast);
    Ok(())
}

async fn control_loop(hub: Arc<Hub>, mut battery: BatteryMonitor) {
    let state = battery.state();
    let mut timer = TickTimer::new(Instant::now(), CONTROL_LOOP_PERIOD);

    info!(
        "control loop started: {} ms period",
        CONTROL_LOOP_PERIOD.as_millis()
    );

    loop {
        tokio::time::sleep_until(tokio::time::Instant::from_std(timer.deadline())).await;
        let now = Instant::now();

        // Battery first so controllers see a fresh duty ceiling this tick
        if let Err(e) = battery.refresh() {
            warn!("battery refresh failed: {}", e);
        }

        hub.tick(now, &state);

        timer.advance(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(5);

    #[test]
    fn test_on_time_tick_advances_by_one_period() {
        let start = Instant::now();
        let mut timer = TickTimer::new(start, PERIOD);
        let first = timer.deadline();

        // The tick finished well before the next deadline
        let next = timer.advance(first - Duration::from_millis(4));
        assert_eq!(next, first + PERIOD);
    }

    #[test]
    fn test_small_delay_keeps_average_rate() {
        let start = Instant::now();
        let mut timer = TickTimer::new(start, PERIOD);
        let first = timer.deadline();

        // Finished 2 ms late: the deadline still advances from the schedule,
        // not from now, so the average period stays at 5 ms
        let next = timer.advance(first + Duration::from_millis(2));
        assert_eq!(next, first + PERIOD);
    }

    #[test]
    fn test_long_stall_resets_to_now_plus_period() {
        let start = Instant::now();
        let mut timer = TickTimer::new(start, PERIOD);
        let missed = timer.deadline();

        // Tick stalled for 3 periods: the next wake is now + period, not
        // missed + period, so at most one tick runs to catch up
        let now = missed + 3 * PERIOD;
        let next = timer.advance(now);
        assert_eq!(next, now + PERIOD);
        assert!(next > now);
    }

    #[test]
    fn test_exactly_one_period_behind_resets() {
        let start = Instant::now();
        let mut timer = TickTimer::new(start, PERIOD);
        let missed = timer.deadline();

        let now = missed + PERIOD;
        let next = timer.advance(now);
        assert_eq!(next, now + PERIOD);
    }
}
