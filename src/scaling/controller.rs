//! Scaling controller — periodic backlog target tracking with scale-to-zero
//!
//! Each cycle reads one backlog sample and computes a desired capacity:
//!
//! - zero backlog → `min_capacity`
//! - at zero capacity, `backlog >= target` → `ceil(backlog / target)` clamped
//!   to `[max(min, 1), max]`; below target → `min_capacity` (zero holds)
//! - otherwise `ceil(current * backlog / target)` clamped to `[min, max]`
//!
//! Scale-out waits for `scale_out_cooldown` since the last scale-out. Scale-in
//! waits for `scale_in_cooldown` since the last scale-out and the last
//! scale-in; scaling to zero also requires the backlog to have been zero for
//! a full `scale_in_cooldown`.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::ScalingPolicy;
use crate::observability::DispatchMetrics;
use crate::scaling::backlog::BacklogSource;
use crate::scaling::executor::{CapacityExecutor, ScaleDecision, ScaleDirection, ScalingTarget};

/// Controller-owned decision state. Only mutated when a capacity change was
/// accepted by the executor, or by observing a non-zero backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalingState {
    pub desired_capacity: u32,
    pub last_scale_out_at: Option<Instant>,
    pub last_scale_in_at: Option<Instant>,
    /// Last cycle whose backlog was non-zero
    pub last_active_at: Option<Instant>,
}

/// Outcome of one evaluation cycle
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A capacity change was applied
    Scaled(ScaleDecision),
    /// The sample was read and no change was needed or allowed
    Unchanged,
    /// The cycle was abandoned; the previous desired capacity persists
    Skipped(String),
}

/// Compute the desired capacity for a backlog sample.
pub fn compute_desired_capacity(policy: &ScalingPolicy, current: u32, backlog: f64) -> u32 {
    let min = policy.min_capacity;
    let max = policy.max_capacity.max(min);

    if backlog <= 0.0 {
        return min;
    }

    if current == 0 {
        if backlog >= policy.target_value {
            let desired = (backlog / policy.target_value).ceil() as u32;
            return desired.max(min.max(1)).min(max);
        }
        return min;
    }

    let desired = (current as f64 * backlog / policy.target_value).ceil() as u32;
    desired.max(min).min(max)
}

fn elapsed_at_least(since: Option<Instant>, now: Instant, window: std::time::Duration) -> bool {
    match since {
        Some(t) => now.saturating_duration_since(t) >= window,
        None => true,
    }
}

/// Scaling controller for one endpoint variant
pub struct ScalingController {
    policy: ScalingPolicy,
    target: ScalingTarget,
    source: Arc<dyn BacklogSource>,
    executor: Arc<dyn CapacityExecutor>,
    metrics: Arc<DispatchMetrics>,
    state: ScalingState,
}

impl ScalingController {
    pub fn new(
        policy: ScalingPolicy,
        target: ScalingTarget,
        source: Arc<dyn BacklogSource>,
        executor: Arc<dyn CapacityExecutor>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let state = ScalingState {
            desired_capacity: policy.min_capacity,
            ..ScalingState::default()
        };
        Self {
            policy,
            target,
            source,
            executor,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> &ScalingState {
        &self.state
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Seed the desired capacity from the endpoint's actual instance count.
    ///
    /// Running instances are treated as freshly scaled out, so they are kept
    /// for at least one scale-in cooldown.
    pub async fn sync_capacity(&mut self, now: Instant) {
        match self.executor.current_capacity(&self.target).await {
            Ok(capacity) => {
                self.state.desired_capacity = capacity;
                if capacity > 0 {
                    self.state.last_scale_out_at = Some(now);
                }
                tracing::info!(
                    resource = %self.target,
                    executor = self.executor.name(),
                    capacity,
                    "Seeded capacity from endpoint"
                );
            }
            Err(e) => {
                self.state.desired_capacity = self.policy.min_capacity;
                tracing::warn!(
                    resource = %self.target,
                    error = %e,
                    assumed = self.policy.min_capacity,
                    "Failed to read current capacity, assuming minimum"
                );
            }
        }
        self.metrics.set_desired_capacity(self.state.desired_capacity);
    }

    /// Record a backlog observation
    pub fn observe(&mut self, backlog: f64, now: Instant) {
        if backlog > 0.0 {
            self.state.last_active_at = Some(now);
        }
    }

    /// Decide whether a sample warrants a capacity change at `now`.
    ///
    /// Does not mutate state; see [`ScalingController::commit`].
    pub fn evaluate(&self, backlog: f64, now: Instant) -> Option<ScaleDecision> {
        let current = self.state.desired_capacity;
        let desired = compute_desired_capacity(&self.policy, current, backlog);

        if desired == current {
            return None;
        }

        let direction = if desired > current {
            if !elapsed_at_least(
                self.state.last_scale_out_at,
                now,
                self.policy.scale_out_cooldown(),
            ) {
                tracing::debug!(current, desired, "Scale-out blocked by cooldown");
                return None;
            }
            ScaleDirection::Out
        } else {
            let cooldown = self.policy.scale_in_cooldown();
            let quiet = elapsed_at_least(self.state.last_scale_out_at, now, cooldown)
                && elapsed_at_least(self.state.last_scale_in_at, now, cooldown)
                && (desired > 0 || elapsed_at_least(self.state.last_active_at, now, cooldown));
            if !quiet {
                tracing::debug!(current, desired, "Scale-in blocked by cooldown");
                return None;
            }
            ScaleDirection::In
        };

        let reason = format!(
            "{}: backlog={:.3}, target={}, current={}, desired={}",
            direction, backlog, self.policy.target_value, current, desired
        );

        Some(ScaleDecision {
            target: self.target.clone(),
            direction,
            current_capacity: current,
            desired_capacity: desired,
            backlog,
            reason,
        })
    }

    /// Commit a decision the executor accepted
    pub fn commit(&mut self, decision: &ScaleDecision, now: Instant) {
        self.state.desired_capacity = decision.desired_capacity;
        match decision.direction {
            ScaleDirection::Out => self.state.last_scale_out_at = Some(now),
            ScaleDirection::In => self.state.last_scale_in_at = Some(now),
        }
    }

    /// Run one evaluation cycle now
    pub async fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now()).await
    }

    /// Run one evaluation cycle as of `now`
    pub async fn tick_at(&mut self, now: Instant) -> TickOutcome {
        let sample = match self.source.latest(&self.policy, &self.target).await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                tracing::debug!(
                    metric = self.policy.metric_name,
                    "No backlog datapoints, skipping cycle"
                );
                return TickOutcome::Skipped("no datapoints".to_string());
            }
            Err(e) => {
                self.metrics.record_scaling_error();
                tracing::warn!(
                    source = self.source.name(),
                    error = %e,
                    "Failed to read backlog metric, skipping cycle"
                );
                return TickOutcome::Skipped(e.to_string());
            }
        };

        if !sample.value.is_finite() {
            self.metrics.record_scaling_error();
            tracing::warn!(value = sample.value, "Non-finite backlog sample, skipping cycle");
            return TickOutcome::Skipped(format!("non-finite sample {}", sample.value));
        }

        self.metrics.set_last_backlog(sample.value);
        self.observe(sample.value, now);

        let Some(decision) = self.evaluate(sample.value, now) else {
            return TickOutcome::Unchanged;
        };

        tracing::info!(
            resource = %decision.target,
            direction = %decision.direction,
            from = decision.current_capacity,
            to = decision.desired_capacity,
            reason = decision.reason,
            "Scaling decision"
        );

        match self.executor.execute(&decision).await {
            Ok(result) if result.accepted => {
                self.commit(&decision, now);
                self.metrics
                    .record_scale(decision.current_capacity, decision.desired_capacity);
                TickOutcome::Scaled(decision)
            }
            Ok(result) => {
                self.metrics.record_scaling_error();
                tracing::warn!(
                    executor = self.executor.name(),
                    message = result.message,
                    "Scaling decision rejected"
                );
                TickOutcome::Skipped(result.message)
            }
            Err(e) => {
                self.metrics.record_scaling_error();
                tracing::warn!(
                    executor = self.executor.name(),
                    error = %e,
                    "Failed to apply scaling decision"
                );
                TickOutcome::Skipped(e.to_string())
            }
        }
    }

    /// Seed capacity, then evaluate every period until shutdown is signalled.
    /// Cycles run sequentially, so evaluations never overlap.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.sync_capacity(Instant::now()).await;

        let mut interval = tokio::time::interval(self.policy.evaluation_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            resource = %self.target,
            period_secs = self.policy.evaluation_period_secs,
            min = self.policy.min_capacity,
            max = self.policy.max_capacity,
            "Scaling controller started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(resource = %self.target, "Scaling controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::backlog::ScriptedBacklogSource;
    use crate::scaling::executor::MockCapacityExecutor;
    use std::time::Duration;

    fn policy() -> ScalingPolicy {
        ScalingPolicy::default()
    }

    fn target() -> ScalingTarget {
        ScalingTarget::new("WhisperEndpoint", "WhisperVariant")
    }

    struct Harness {
        controller: ScalingController,
        source: Arc<ScriptedBacklogSource>,
        executor: Arc<MockCapacityExecutor>,
        metrics: Arc<DispatchMetrics>,
    }

    fn harness(policy: ScalingPolicy) -> Harness {
        let source = Arc::new(ScriptedBacklogSource::new());
        let executor = Arc::new(MockCapacityExecutor::new());
        let metrics = Arc::new(DispatchMetrics::new());
        let controller = ScalingController::new(
            policy,
            target(),
            source.clone(),
            executor.clone(),
            metrics.clone(),
        );
        Harness {
            controller,
            source,
            executor,
            metrics,
        }
    }

    // --- compute_desired_capacity ---

    #[test]
    fn test_formula_zero_backlog_returns_min() {
        assert_eq!(compute_desired_capacity(&policy(), 1, 0.0), 0);
        let p = ScalingPolicy {
            min_capacity: 1,
            max_capacity: 3,
            ..policy()
        };
        assert_eq!(compute_desired_capacity(&p, 3, 0.0), 1);
    }

    #[test]
    fn test_formula_from_zero_at_target() {
        assert_eq!(compute_desired_capacity(&policy(), 0, 0.99), 1);
        assert_eq!(compute_desired_capacity(&policy(), 0, 50.0), 1);
    }

    #[test]
    fn test_formula_from_zero_below_target_holds() {
        assert_eq!(compute_desired_capacity(&policy(), 0, 0.5), 0);
    }

    #[test]
    fn test_formula_target_tracking() {
        let p = ScalingPolicy {
            max_capacity: 10,
            target_value: 2.0,
            ..policy()
        };
        // ceil(2 * 5 / 2) = 5
        assert_eq!(compute_desired_capacity(&p, 2, 5.0), 5);
        // ceil(4 * 1 / 2) = 2
        assert_eq!(compute_desired_capacity(&p, 4, 1.0), 2);
        // ceil(4 * 100 / 2) = 200, clamped to 10
        assert_eq!(compute_desired_capacity(&p, 4, 100.0), 10);
        // from zero: ceil(7 / 2) = 4
        assert_eq!(compute_desired_capacity(&p, 0, 7.0), 4);
    }

    #[test]
    fn test_formula_default_policy_stays_within_bounds() {
        for backlog in [0.0, 0.1, 0.99, 1.0, 3.7, 1e9] {
            for current in [0, 1] {
                let d = compute_desired_capacity(&policy(), current, backlog);
                assert!(d <= 1, "backlog={} current={} desired={}", backlog, current, d);
            }
        }
    }

    // --- evaluate ---

    #[test]
    fn test_evaluate_scale_out_from_zero() {
        let h = harness(policy());
        let decision = h.controller.evaluate(1.0, Instant::now()).unwrap();
        assert_eq!(decision.direction, ScaleDirection::Out);
        assert_eq!(decision.current_capacity, 0);
        assert_eq!(decision.desired_capacity, 1);
        assert!(decision.reason.contains("backlog"));
    }

    #[test]
    fn test_evaluate_is_pure() {
        let h = harness(policy());
        let now = Instant::now();
        assert!(h.controller.evaluate(1.0, now).is_some());
        assert!(h.controller.evaluate(1.0, now).is_some());
        assert_eq!(h.controller.state().desired_capacity, 0);
    }

    #[test]
    fn test_evaluate_scale_out_cooldown() {
        let p = ScalingPolicy {
            max_capacity: 4,
            scale_out_cooldown_secs: 120,
            ..policy()
        };
        let mut h = harness(p);
        let t0 = Instant::now();
        let first = h.controller.evaluate(1.0, t0).unwrap();
        h.controller.commit(&first, t0);

        assert!(h.controller.evaluate(3.0, t0 + Duration::from_secs(60)).is_none());
        let second = h
            .controller
            .evaluate(3.0, t0 + Duration::from_secs(120))
            .unwrap();
        assert_eq!(second.desired_capacity, 4);
    }

    #[test]
    fn test_evaluate_scale_in_waits_for_cooldown() {
        let mut h = harness(policy());
        let t0 = Instant::now();
        h.controller.observe(1.0, t0);
        let out = h.controller.evaluate(1.0, t0).unwrap();
        h.controller.commit(&out, t0);

        assert!(h.controller.evaluate(0.0, t0 + Duration::from_secs(60)).is_none());
        assert!(h.controller.evaluate(0.0, t0 + Duration::from_secs(299)).is_none());
        let decision = h
            .controller
            .evaluate(0.0, t0 + Duration::from_secs(300))
            .unwrap();
        assert_eq!(decision.direction, ScaleDirection::In);
        assert_eq!(decision.desired_capacity, 0);
    }

    #[test]
    fn test_evaluate_scale_to_zero_requires_sustained_idleness() {
        let mut h = harness(policy());
        let t0 = Instant::now();
        let out = h.controller.evaluate(1.0, t0).unwrap();
        h.controller.commit(&out, t0);

        // backlog reappears at t0+250; at capacity 1 it is absorbed without a change
        h.controller.observe(0.5, t0 + Duration::from_secs(250));

        assert!(h.controller.evaluate(0.0, t0 + Duration::from_secs(400)).is_none());
        assert!(h.controller.evaluate(0.0, t0 + Duration::from_secs(550)).is_some());
    }

    #[test]
    fn test_commit_updates_state() {
        let mut h = harness(policy());
        let t0 = Instant::now();
        let out = h.controller.evaluate(1.0, t0).unwrap();
        h.controller.commit(&out, t0);
        assert_eq!(h.controller.state().desired_capacity, 1);
        assert_eq!(h.controller.state().last_scale_out_at, Some(t0));
        assert_eq!(h.controller.state().last_scale_in_at, None);
    }

    // --- tick ---

    #[tokio::test]
    async fn test_tick_backlog_lifecycle() {
        let mut h = harness(policy());
        let t0 = Instant::now();

        h.source.push_value(0.99);
        let outcome = h.controller.tick_at(t0).await;
        assert!(matches!(outcome, TickOutcome::Scaled(ref d) if d.desired_capacity == 1));

        h.source.push_value(0.0);
        assert_eq!(
            h.controller.tick_at(t0 + Duration::from_secs(60)).await,
            TickOutcome::Unchanged
        );
        assert_eq!(h.controller.state().desired_capacity, 1);

        for secs in [120, 180, 240] {
            h.controller.tick_at(t0 + Duration::from_secs(secs)).await;
            assert_eq!(h.controller.state().desired_capacity, 1);
        }

        let outcome = h.controller.tick_at(t0 + Duration::from_secs(301)).await;
        assert!(matches!(outcome, TickOutcome::Scaled(ref d) if d.desired_capacity == 0));
        assert_eq!(h.executor.decisions().len(), 2);

        let snap = h.metrics.snapshot();
        assert_eq!(snap.scale_outs, 1);
        assert_eq!(snap.scale_ins, 1);
        assert_eq!(snap.desired_capacity, 0);
    }

    #[tokio::test]
    async fn test_tick_metric_error_skips() {
        let mut h = harness(policy());
        h.source.push_error("throttled");
        let outcome = h.controller.tick_at(Instant::now()).await;
        assert!(matches!(outcome, TickOutcome::Skipped(_)));
        assert_eq!(h.controller.state().desired_capacity, 0);
        assert!(h.executor.decisions().is_empty());
        assert_eq!(h.metrics.snapshot().scaling_errors, 1);
    }

    #[tokio::test]
    async fn test_tick_missing_sample_skips() {
        let mut h = harness(policy());
        h.source.push_missing();
        let outcome = h.controller.tick_at(Instant::now()).await;
        assert_eq!(outcome, TickOutcome::Skipped("no datapoints".to_string()));
        assert!(h.executor.decisions().is_empty());
    }

    #[tokio::test]
    async fn test_tick_non_finite_sample_skips() {
        let mut h = harness(policy());
        h.source.push_value(f64::NAN);
        assert!(matches!(
            h.controller.tick_at(Instant::now()).await,
            TickOutcome::Skipped(_)
        ));
        h.source.push_value(f64::INFINITY);
        assert!(matches!(
            h.controller.tick_at(Instant::now()).await,
            TickOutcome::Skipped(_)
        ));
        assert!(h.executor.decisions().is_empty());
    }

    #[tokio::test]
    async fn test_tick_executor_failure_keeps_state() {
        let mut h = harness(policy());
        h.executor.set_failing(true);
        h.source.push_value(2.0);
        let t0 = Instant::now();
        assert!(matches!(h.controller.tick_at(t0).await, TickOutcome::Skipped(_)));
        assert_eq!(h.controller.state().desired_capacity, 0);
        assert_eq!(h.controller.state().last_scale_out_at, None);

        // recovers on the next cycle
        h.executor.set_failing(false);
        assert!(matches!(
            h.controller.tick_at(t0 + Duration::from_secs(60)).await,
            TickOutcome::Scaled(_)
        ));
        assert_eq!(h.controller.state().desired_capacity, 1);
    }

    // --- sync_capacity ---

    #[tokio::test]
    async fn test_sync_capacity_seeds_running_instances() {
        let mut h = harness(policy());
        h.executor.set_capacity(&target(), 1);
        let t0 = Instant::now();
        h.controller.sync_capacity(t0).await;
        assert_eq!(h.controller.state().desired_capacity, 1);
        assert_eq!(h.controller.state().last_scale_out_at, Some(t0));

        // running instances are kept for one scale-in cooldown
        assert!(h.controller.evaluate(0.0, t0 + Duration::from_secs(10)).is_none());
        assert!(h.controller.evaluate(0.0, t0 + Duration::from_secs(300)).is_some());
    }

    #[tokio::test]
    async fn test_sync_capacity_failure_assumes_min() {
        let p = ScalingPolicy {
            min_capacity: 1,
            max_capacity: 2,
            ..policy()
        };
        let mut h = harness(p);
        h.executor.set_failing(true);
        h.controller.sync_capacity(Instant::now()).await;
        assert_eq!(h.controller.state().desired_capacity, 1);
        assert_eq!(h.controller.state().last_scale_out_at, None);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(ScalingPolicy {
            evaluation_period_secs: 3600,
            ..policy()
        });
        h.source.push_value(1.0);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.controller.run(rx));

        // the first interval tick fires immediately
        for _ in 0..50 {
            if !h.executor.decisions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.executor.decisions().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
