//! Polling primitives for node lifecycle transitions.
//!
//! Every mutation sent to the control plane completes asynchronously, so each
//! operation pairs its request with a [`WaitLoop`] that polls until the node
//! reaches the target state:
//!
//! ```text
//!   ┌──────────┐  abort?  ┌──────────┐  done?  ┌──────────┐
//!   │  tick n  │ ───────► │   poll   │ ──────► │  return  │
//!   └──────────┘          └──────────┘         └──────────┘
//!        ▲                     │ fail? ──► error
//!        │      sleep          ▼
//!        └──────────────── pending (bounded by attempts / timeout)
//! ```
//!
//! Loops yield at every interval, observe a per-loop attempt bound and an
//! optional wall-clock bound, and leave cleanup of partially-applied state to
//! the caller.

use std::future::Future;
use std::time::Duration;

use metal_agent_core::{InstanceId, Node, ProvisionState};
use rand::Rng;
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::registry::{TaskState, VmState, Workload};

// ============================================================================
// Backoff
// ============================================================================

/// Delay policy between polls.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the second poll.
    pub initial: Duration,
    /// Upper bound on any delay, before jitter.
    pub max: Duration,
    /// Jitter factor (0.0 to 1.0) applied symmetrically around the delay.
    pub jitter: f64,
}

impl Backoff {
    /// A constant interval with no jitter.
    #[must_use]
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            jitter: 0.0,
        }
    }

    /// Doubling delays from `initial`, capped at `max`, with `jitter`.
    #[must_use]
    pub const fn exponential(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter,
        }
    }

    /// Calculate the delay after the given zero-based attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
        let delay = (self.initial.as_secs_f64() * 2.0_f64.powi(exponent))
            .min(self.max.as_secs_f64().max(self.initial.as_secs_f64()));

        let spread = delay * self.jitter.clamp(0.0, 1.0);
        let delay = if spread > 0.0 {
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };

        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(self.max)
    }
}

// ============================================================================
// Wait loop
// ============================================================================

/// A bounded polling loop.
#[derive(Debug, Clone)]
pub struct WaitLoop {
    what: String,
    backoff: Backoff,
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
}

impl WaitLoop {
    /// Create an unbounded loop polling every `interval`.
    #[must_use]
    pub fn new(what: impl Into<String>, interval: Duration) -> Self {
        Self {
            what: what.into(),
            backoff: Backoff::fixed(interval),
            max_attempts: None,
            timeout: None,
        }
    }

    /// Replace the delay policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up with [`DriverError::GaveUp`] after `attempts` polls.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Fail with [`DriverError::WaitTimeout`] after `timeout`, if given.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Describe what this loop waits for.
    #[must_use]
    pub fn what(&self) -> &str {
        &self.what
    }

    /// Poll until `poll` yields a value.
    ///
    /// # Errors
    ///
    /// Returns the first error from `poll`, `DriverError::GaveUp` once the
    /// attempt bound is reached, or `DriverError::WaitTimeout` once the time
    /// bound is reached.
    pub async fn poll_until<T, P, PFut>(&self, mut poll: P) -> Result<T>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Option<T>>>,
    {
        self.bounded(async {
            let mut attempt = 0;
            loop {
                attempt += 1;
                if let Some(value) = poll().await? {
                    return Ok(value);
                }
                self.pause(attempt).await?;
            }
        })
        .await
    }

    /// Poll a node until `done_when` holds.
    ///
    /// Each tick first evaluates `abort_when`, which re-reads whatever external
    /// state may cancel the wait; a returned error ends the loop before the node
    /// is polled. `poll` returning `None` means there is nothing left to wait
    /// for and ends the loop successfully. `fail_when` turns a node into a
    /// lifecycle failure.
    ///
    /// Returns the number of polls made.
    ///
    /// # Errors
    ///
    /// Returns the abort or failure error, the first error from `poll`,
    /// `DriverError::GaveUp` or `DriverError::WaitTimeout`.
    pub async fn wait_for_node<A, AFut, P, PFut, D, F>(
        &self,
        mut abort_when: A,
        mut poll: P,
        done_when: D,
        fail_when: F,
    ) -> Result<u32>
    where
        A: FnMut() -> AFut,
        AFut: Future<Output = Result<Option<DriverError>>>,
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Option<Node>>>,
        D: Fn(&Node) -> bool,
        F: Fn(&Node) -> Option<DriverError>,
    {
        self.bounded(async {
            let mut attempt = 0;
            loop {
                attempt += 1;
                if let Some(error) = abort_when().await? {
                    return Err(error);
                }
                let Some(node) = poll().await? else {
                    return Ok(attempt);
                };
                if done_when(&node) {
                    return Ok(attempt);
                }
                if let Some(error) = fail_when(&node) {
                    return Err(error);
                }
                debug!(
                    node_id = %node.id,
                    attempt,
                    provision_state = ?node.provision_state,
                    power_state = ?node.power_state,
                    "Still waiting for {}",
                    self.what
                );
                self.pause(attempt).await?;
            }
        })
        .await
    }

    async fn pause(&self, attempt: u32) -> Result<()> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return Err(DriverError::GaveUp {
                    attempts: attempt,
                    message: self.what.clone(),
                });
            }
        }
        tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                DriverError::WaitTimeout(format!("{} did not finish within {limit:?}", self.what))
            })?,
            None => fut.await,
        }
    }
}

/// No abort condition.
///
/// # Errors
///
/// Never fails.
#[allow(clippy::unused_async)]
pub async fn never_abort() -> Result<Option<DriverError>> {
    Ok(None)
}

// ============================================================================
// Predicates
// ============================================================================

/// States from which a node must be torn down through the control plane.
pub const UNPROVISION_STATES: &[ProvisionState] = &[
    ProvisionState::Active,
    ProvisionState::DeployFail,
    ProvisionState::Error,
    ProvisionState::DeployWait,
    ProvisionState::Deploying,
    ProvisionState::Rescue,
    ProvisionState::Rescuing,
    ProvisionState::RescueWait,
    ProvisionState::RescueFail,
    ProvisionState::UnrescueFail,
];

/// Check whether destroying a workload on this node requires an unprovision.
#[must_use]
pub fn needs_unprovision(node: &Node) -> bool {
    node.provision_state
        .is_some_and(|s| UNPROVISION_STATES.contains(&s))
}

/// Check whether a node has finished tearing down from the user's viewpoint.
///
/// A node stuck in clean failed needs operator attention but no longer
/// carries the workload.
#[must_use]
pub fn is_unprovisioned(node: &Node) -> bool {
    matches!(
        node.provision_state,
        None | Some(
            ProvisionState::Available
                | ProvisionState::Cleaning
                | ProvisionState::CleanWait
                | ProvisionState::CleanFail
        )
    )
}

/// Check whether a pending power transition has completed.
#[must_use]
pub fn power_settled(node: &Node) -> bool {
    node.target_power_state.is_none()
}

/// Check whether a deploy should stop because the workload is going away.
///
/// A missing workload counts as deleted. An errored workload aborts the
/// deploy unless it is being rebuilt.
#[must_use]
pub fn deploy_aborted(workload: Option<&Workload>) -> bool {
    match workload {
        None => true,
        Some(w) => {
            w.task_state == Some(TaskState::Deleting)
                || w.vm_state == VmState::Deleted
                || (w.vm_state == VmState::Error
                    && w.task_state != Some(TaskState::RebuildSpawning))
        }
    }
}

/// Classify a node observed while waiting for a deploy.
#[must_use]
pub fn deploy_failure(node: &Node, instance_id: &InstanceId) -> Option<DriverError> {
    let torn_down = matches!(
        node.target_provision_state,
        Some(ProvisionState::Deleted | ProvisionState::Available)
    ) || matches!(
        node.provision_state,
        None | Some(ProvisionState::Available)
    );
    if torn_down {
        return Some(DriverError::InstanceNotFound(format!(
            "instance {instance_id} was removed from node {} during deploy",
            node.id
        )));
    }
    if node.provision_state == Some(ProvisionState::DeployFail) {
        return Some(DriverError::DeployFailure(format!(
            "Failed to provision instance {instance_id}: {}",
            last_error(node)
        )));
    }
    None
}

/// Classify a node observed while waiting for rescue.
#[must_use]
pub fn rescue_failure(node: &Node) -> Option<DriverError> {
    (node.provision_state == Some(ProvisionState::RescueFail))
        .then(|| DriverError::RescueFailure(last_error(node)))
}

/// Classify a node observed while waiting to leave rescue.
#[must_use]
pub fn unrescue_failure(node: &Node) -> Option<DriverError> {
    (node.provision_state == Some(ProvisionState::UnrescueFail))
        .then(|| DriverError::UnrescueFailure(last_error(node)))
}

fn last_error(node: &Node) -> String {
    node.last_error
        .clone()
        .unwrap_or_else(|| format!("node {} reported no error", node.id))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use metal_agent_core::{HostName, NodeId, PowerState};

    use super::*;

    fn node(state: Option<ProvisionState>) -> Node {
        let mut node = Node::new(NodeId::new("n1").unwrap());
        node.provision_state = state;
        node
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(Duration::from_secs(2));
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(10), Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_is_capped_and_jittered() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(8), 0.5);
        for attempt in 0..10 {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay <= Duration::from_secs(12), "{delay:?}");
        }
        let plain = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(8), 0.0);
        assert_eq!(plain.delay(2), Duration::from_secs(4));
        assert_eq!(plain.delay(5), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let polls = AtomicU32::new(0);
        let counter = &polls;
        let wait = WaitLoop::new("node to settle", Duration::from_secs(2)).with_max_attempts(5);

        let err = wait
            .wait_for_node(
                never_abort,
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(node(Some(ProvisionState::Active))))
                },
                is_unprovisioned,
                |_| None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::GaveUp { attempts: 5, .. }));
        assert_eq!(polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_prevents_polling() {
        let polls = AtomicU32::new(0);
        let counter = &polls;
        let wait = WaitLoop::new("deploy", Duration::from_secs(2));

        let err = wait
            .wait_for_node(
                || async { Ok(Some(DriverError::DeployFailure("deleted".into()))) },
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(node(Some(ProvisionState::Deploying))))
                },
                |_| false,
                |_| None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::DeployFailure(_)));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let wait = WaitLoop::new("power", Duration::from_secs(1))
            .with_timeout(Some(Duration::from_secs(5)));

        let err = wait
            .wait_for_node(
                never_abort,
                || async {
                    let mut n = node(Some(ProvisionState::Active));
                    n.target_power_state = Some(PowerState::PowerOff);
                    Ok(Some(n))
                },
                power_settled,
                |_| None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::WaitTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_value() {
        let polls = AtomicU32::new(0);
        let counter = &polls;
        let wait = WaitLoop::new("value", Duration::from_millis(100));

        let value = wait
            .poll_until(move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok((n == 2).then_some("ready"))
            })
            .await
            .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unprovision_states() {
        assert!(needs_unprovision(&node(Some(ProvisionState::Active))));
        assert!(needs_unprovision(&node(Some(ProvisionState::DeployWait))));
        assert!(!needs_unprovision(&node(Some(ProvisionState::Available))));
        assert!(!needs_unprovision(&node(None)));

        assert!(is_unprovisioned(&node(None)));
        assert!(is_unprovisioned(&node(Some(ProvisionState::CleanFail))));
        assert!(!is_unprovisioned(&node(Some(ProvisionState::Deleting))));
    }

    #[test]
    fn deploy_classification() {
        let instance = InstanceId::generate();

        let mut failed = node(Some(ProvisionState::DeployFail));
        failed.last_error = Some("PXE timeout".into());
        assert!(matches!(
            deploy_failure(&failed, &instance),
            Some(DriverError::DeployFailure(msg)) if msg.contains("PXE timeout")
        ));

        let mut deleting = node(Some(ProvisionState::DeployWait));
        deleting.target_provision_state = Some(ProvisionState::Deleted);
        assert!(matches!(
            deploy_failure(&deleting, &instance),
            Some(DriverError::InstanceNotFound(_))
        ));

        assert!(deploy_failure(&node(Some(ProvisionState::Deploying)), &instance).is_none());
    }

    #[test]
    fn deploy_abort_rules() {
        let mut workload = Workload::new(
            InstanceId::generate(),
            "vm",
            HostName::localhost(),
            NodeId::new("n1").unwrap(),
        );
        assert!(!deploy_aborted(Some(&workload)));
        assert!(deploy_aborted(None));

        workload.vm_state = VmState::Error;
        assert!(deploy_aborted(Some(&workload)));

        workload.task_state = Some(TaskState::RebuildSpawning);
        assert!(!deploy_aborted(Some(&workload)));

        workload.vm_state = VmState::Building;
        workload.task_state = Some(TaskState::Deleting);
        assert!(deploy_aborted(Some(&workload)));
    }
}
