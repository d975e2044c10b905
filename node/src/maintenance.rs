use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::error::ChordError;
use crate::network_client::NetworkClient;
use crate::node::ChordNode;

/// Periods of the three repair loops and the time budget of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub check_predecessor_interval: Duration,
    pub task_timeout: Duration,
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            stabilize_interval: Duration::from_secs(1),
            fix_fingers_interval: Duration::from_millis(500),
            check_predecessor_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(3),
        }
    }
}

impl MaintenanceSchedule {
    pub fn has_zero_interval(&self) -> bool {
        [
            self.stabilize_interval,
            self.fix_fingers_interval,
            self.check_predecessor_interval,
            self.task_timeout,
        ]
        .iter()
        .any(Duration::is_zero)
    }
}

/// Starts stabilize, fix_fingers and check_predecessor on independent timers.
/// Every task stops once `shutdown` turns true or its sender is dropped.
pub fn spawn<T: NetworkClient>(
    node: ChordNode<T>,
    schedule: MaintenanceSchedule,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let budget = schedule.task_timeout;
    let stabilizer = node.clone();
    let finger_fixer = node.clone();
    let checker = node;
    vec![
        spawn_periodic(
            "stabilize",
            schedule.stabilize_interval,
            budget,
            shutdown.clone(),
            stabilizer,
            |node| async move { node.stabilize().await },
        ),
        spawn_periodic(
            "fix_fingers",
            schedule.fix_fingers_interval,
            budget,
            shutdown.clone(),
            finger_fixer,
            |node| async move { node.fix_fingers().await },
        ),
        spawn_periodic(
            "check_predecessor",
            schedule.check_predecessor_interval,
            budget,
            shutdown,
            checker,
            |node| async move { node.check_predecessor().await },
        ),
    ]
}

fn spawn_periodic<T, F, Fut>(
    name: &'static str,
    period: Duration,
    budget: Duration,
    mut shutdown: watch::Receiver<bool>,
    node: ChordNode<T>,
    tick: F,
) -> JoinHandle<()>
where
    T: NetworkClient,
    F: Fn(ChordNode<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ChordError>> + Send + 'static,
{
    // Random first tick so nodes started together do not probe in lockstep.
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=period.as_millis() as u64));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + jitter, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match timeout(budget, tick(node.clone())).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log_debug!(node.info.address, "{} failed: {}", name, e),
                        Err(_) => log_warn!(
                            node.info.address,
                            "{} exceeded its {:?} budget",
                            name,
                            budget
                        ),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log_debug!(node.info.address, "{} task stopped", name);
                        break;
                    }
                }
            }
        }
    })
}
