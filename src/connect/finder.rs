//! Acquiring a connection for an exchange.
//!
//! The sequential finder tries plans one at a time. The fast-fallback
//! finder launches a TCP connect every 250 ms against successive routes
//! and keeps the first winner, canceling the rest (RFC 8305 behavior at
//! the route level).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::Error;

use super::connection::Connection;
use super::planner::{ConnectPlan, Plan, RoutePlanner};

/// Delay between successive racing connect attempts.
pub(crate) const CONNECT_ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on one fast-fallback race when no attempt reports.
const RACE_STALL_LIMIT: Duration = Duration::from_secs(10);

pub(crate) struct ExchangeFinder {
    planner: Arc<RoutePlanner>,
    fast_fallback: bool,
    canceled: Arc<AtomicBool>,
}

impl ExchangeFinder {
    pub(crate) fn new(
        planner: Arc<RoutePlanner>,
        fast_fallback: bool,
        canceled: Arc<AtomicBool>,
    ) -> ExchangeFinder {
        ExchangeFinder {
            planner,
            fast_fallback,
            canceled,
        }
    }

    /// Finds a healthy connection reserved for this call.
    pub(crate) fn find(&self, require_multiplexed: bool) -> crate::Result<Arc<Connection>> {
        if self.fast_fallback {
            self.find_with_fast_fallback(require_multiplexed)
        } else {
            self.find_sequentially(require_multiplexed)
        }
    }

    fn check_canceled(&self) -> crate::Result<()> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(Error::new_canceled());
        }
        Ok(())
    }

    /// Tries plans one at a time until one connects.
    fn find_sequentially(&self, require_multiplexed: bool) -> crate::Result<Arc<Connection>> {
        let mut first_error: Option<Error> = None;
        loop {
            self.check_canceled()?;
            if !self.planner.has_next() {
                return Err(first_error
                    .unwrap_or_else(|| Error::new_connect("exhausted all routes")));
            }
            let plan = match self.planner.plan(require_multiplexed) {
                Ok(plan) => plan,
                Err(e) => {
                    return Err(merge_errors(first_error, e));
                }
            };
            match plan {
                Plan::Ready(connection) => return Ok(connection),
                Plan::Connect(connect_plan) => match connect_plan.connect() {
                    Ok(connection) => {
                        if connection.reserve(self.planner.call()) {
                            return Ok(connection);
                        }
                        // Full before we could board; try again.
                        continue;
                    }
                    Err(e) => {
                        debug!("sequential connect failed: {}", e);
                        first_error = Some(match first_error {
                            Some(primary) => primary.with_suppressed(e),
                            None => e,
                        });
                    }
                },
            }
        }
    }

    /// Races connect attempts, starting a new one every 250 ms while
    /// earlier attempts are still pending.
    fn find_with_fast_fallback(
        &self,
        require_multiplexed: bool,
    ) -> crate::Result<Arc<Connection>> {
        let (results_tx, results_rx) =
            mpsc::channel::<(usize, crate::Result<Arc<Connection>>)>();
        let mut in_flight: Vec<InFlightAttempt> = Vec::new();
        let mut first_error: Option<Error> = None;
        let mut next_attempt_at = Instant::now();
        let mut next_attempt_id = 0usize;

        let result = loop {
            if let Err(e) = self.check_canceled() {
                break Err(e);
            }

            // Launch the next attempt when its delay has elapsed.
            if Instant::now() >= next_attempt_at && self.planner.has_next() {
                match self.planner.plan(require_multiplexed) {
                    Ok(Plan::Ready(connection)) => break Ok(connection),
                    Ok(Plan::Connect(plan)) => {
                        let id = next_attempt_id;
                        next_attempt_id += 1;
                        trace!("fast fallback launching attempt {} -> {:?}", id, plan.route);
                        launch_attempt(id, plan.clone(), results_tx.clone(), &self.planner);
                        in_flight.push(InFlightAttempt { id, plan });
                        next_attempt_at = Instant::now() + CONNECT_ATTEMPT_DELAY;
                    }
                    Err(e) => {
                        first_error = Some(match first_error {
                            Some(primary) => primary.with_suppressed(e),
                            None => e,
                        });
                    }
                }
            }

            if in_flight.is_empty() && !self.planner.has_next() {
                break Err(first_error
                    .take()
                    .unwrap_or_else(|| Error::new_connect("exhausted all routes")));
            }

            // Wait for a result, but no longer than the launch cadence
            // allows when more routes could be raced.
            let timeout = if self.planner.has_next() && !in_flight.is_empty() {
                next_attempt_at.saturating_duration_since(Instant::now())
            } else if in_flight.is_empty() {
                Duration::ZERO
            } else {
                RACE_STALL_LIMIT
            };
            match results_rx.recv_timeout(timeout.max(Duration::from_millis(1))) {
                Ok((id, Ok(connection))) => {
                    in_flight.retain(|attempt| attempt.id != id);
                    if connection.reserve(self.planner.call()) {
                        break Ok(connection);
                    }
                }
                Ok((id, Err(e))) => {
                    trace!("fast fallback attempt {} failed: {}", id, e);
                    in_flight.retain(|attempt| attempt.id != id);
                    first_error = Some(match first_error {
                        Some(primary) => primary.with_suppressed(e),
                        None => e,
                    });
                    // A fast failure brings the next attempt forward.
                    next_attempt_at = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Err(first_error
                        .take()
                        .unwrap_or_else(|| Error::new_connect("connect attempts vanished")));
                }
            }
        };

        // Whatever the outcome, the losers must stop. A loser that still
        // completes parks its connection as a deferred plan.
        for attempt in &in_flight {
            attempt.plan.cancel();
        }
        result
    }
}

struct InFlightAttempt {
    id: usize,
    plan: Arc<ConnectPlan>,
}

/// Runs one connect attempt on the task runner's pool. A winner that
/// arrives after cancellation is handed back to the planner for reuse
/// by a follow-up request.
fn launch_attempt(
    id: usize,
    plan: Arc<ConnectPlan>,
    results: mpsc::Sender<(usize, crate::Result<Arc<Connection>>)>,
    planner: &Arc<RoutePlanner>,
) {
    let planner = planner.clone();
    // Each attempt gets its own queue so the race truly runs in
    // parallel; queues of one runner share its thread pool.
    let queue = planner.new_connect_queue();
    queue.execute(format!("connect {:?}", plan.route), 0, true, move || {
        let result = plan.connect();
        match result {
            Ok(connection) if plan.is_canceled() => {
                trace!("attempt {} finished after the race; deferring", id);
                planner.defer(connection);
            }
            other => {
                // The receiver may be gone if the race already ended.
                let _ = results.send((id, other));
            }
        }
    });
}

fn merge_errors(first: Option<Error>, next: Error) -> Error {
    match first {
        Some(primary) => primary.with_suppressed(next),
        None => next,
    }
}
