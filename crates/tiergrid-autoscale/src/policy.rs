//! Autoscaler policy — evaluation and the control task bound to one group.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tiergrid_core::{parse_duration, MetricRange, PolicySpec, SizeRange};
use tiergrid_entity::{
    Capability, Entity, EntityError, Lifecycle, OrchestrationContext, SensorEvent,
    SubscriptionBus, SubscriptionHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{AutoscaleError, AutoscaleResult};

/// A scaling decision for one metric sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Resize to the given member count (already within bounds).
    ScaleTo(u32),
    /// Metric in range, or the target equals the current size.
    NoChange,
}

/// Keeps a group's metric sensor inside `range` by resizing the group.
#[derive(Debug, Clone)]
pub struct AutoscalerPolicy {
    metric: String,
    range: MetricRange,
    cooldown: Duration,
}

impl AutoscalerPolicy {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            range: MetricRange::new(0.0, f64::INFINITY),
            cooldown: Duration::ZERO,
        }
    }

    pub fn metric_range(mut self, lower: f64, upper: f64) -> Self {
        self.range = MetricRange::new(lower, upper);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Build a policy from its topology declaration.
    pub fn from_spec(spec: &PolicySpec) -> AutoscaleResult<Self> {
        match spec {
            PolicySpec::Autoscaler {
                metric,
                metric_range,
                cooldown,
            } => {
                let cooldown = parse_duration(cooldown)
                    .map_err(|e| AutoscaleError::InvalidCooldown(e.to_string()))?;
                Ok(Self::new(metric.clone())
                    .metric_range(metric_range.0, metric_range.1)
                    .cooldown(cooldown))
            }
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    fn check(&self) -> AutoscaleResult<()> {
        if !self.range.is_valid() || self.range.midpoint() <= 0.0 {
            return Err(AutoscaleError::InvalidRange {
                lower: self.range.lower,
                upper: self.range.upper,
            });
        }
        Ok(())
    }

    /// Unclamped target size for a sample, or `None` when it is in range.
    pub fn desired_size(&self, current: u32, metric: f64) -> Option<u32> {
        let mid = self.range.midpoint();
        let desired = if metric > self.range.upper {
            (f64::from(current.max(1)) * metric / mid).ceil()
        } else if metric < self.range.lower {
            (f64::from(current) * metric / mid).ceil()
        } else {
            return None;
        };
        // float-to-int casts saturate: negatives become 0
        Some(desired as u32)
    }

    /// Decide what to do with one sample for a group of `current` members
    /// bounded by `bounds`. A clamped target is logged as a policy
    /// violation.
    pub fn evaluate(&self, group: &str, current: u32, bounds: SizeRange, metric: f64) -> ScaleDecision {
        let Some(wanted) = self.desired_size(current, metric) else {
            trace!(group, metric = %self.metric, value = metric, "metric in range");
            return ScaleDecision::NoChange;
        };
        let target = bounds.clamp(wanted);
        if target != wanted {
            let violation = AutoscaleError::PolicyViolation {
                group: group.to_string(),
                wanted,
                clamped: target,
                min: bounds.min,
                max: bounds.max,
            };
            warn!(metric = %self.metric, value = metric, "{violation}");
        }
        if target == current {
            return ScaleDecision::NoChange;
        }
        debug!(
            group,
            from = current,
            to = target,
            metric = %self.metric,
            value = metric,
            "scaling decision"
        );
        ScaleDecision::ScaleTo(target)
    }

    /// Bind the policy to `group` and spawn its control task.
    ///
    /// The current metric value, if any, is evaluated immediately. Must be
    /// called from within a tokio runtime.
    pub fn attach(
        self,
        ctx: &OrchestrationContext,
        group: &Arc<Entity>,
    ) -> AutoscaleResult<PolicyHandle> {
        self.check()?;
        if !group.has_capability(Capability::Resizable) {
            return Err(AutoscaleError::NotResizable {
                entity: group.label(),
            });
        }

        let name = format!("autoscaler({}:{})", group.label(), self.metric);
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = group.observe_sensor(&self.metric, |current| {
            let feed = tx.clone();
            let handle = ctx.subscribe(group.id(), &self.metric, move |event: &SensorEvent| {
                push_sample(&feed, &event.value)
            });
            if let Some(current) = current {
                push_sample(&tx, &current);
            }
            handle
        });
        drop(tx);

        let requests = Arc::new(AtomicU64::new(0));
        let control = ControlLoop {
            policy: self,
            group: Arc::downgrade(group),
            requests: Arc::clone(&requests),
            last_resize: None,
        };
        let task = tokio::spawn(control.run(rx));
        info!(policy = %name, "autoscaler attached");

        Ok(PolicyHandle {
            name,
            requests,
            bus: Arc::downgrade(ctx.bus()),
            subscription,
            task,
        })
    }
}

fn push_sample(feed: &mpsc::UnboundedSender<f64>, value: &Value) {
    match value.as_f64() {
        Some(sample) => {
            // closed only once the control task has exited
            let _ = feed.send(sample);
        }
        None => trace!(%value, "non-numeric metric sample skipped"),
    }
}

/// What one sample led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    /// Too soon after the last resize; evaluate again once the cooldown ends.
    Deferred,
    Attempted,
}

struct ControlLoop {
    policy: AutoscalerPolicy,
    group: Weak<Entity>,
    requests: Arc<AtomicU64>,
    last_resize: Option<Instant>,
}

impl ControlLoop {
    fn in_cooldown(&self) -> bool {
        self.last_resize
            .is_some_and(|last| last.elapsed() < self.policy.cooldown)
    }

    /// `None` also when the cooldown reaches past what `Instant` can hold.
    fn cooldown_ends(&self) -> Option<Instant> {
        self.last_resize
            .and_then(|last| last.checked_add(self.policy.cooldown))
    }

    async fn run(mut self, mut samples: mpsc::UnboundedReceiver<f64>) {
        // Latest sample that arrived during cooldown.
        let mut deferred: Option<f64> = None;

        // Ends when the subscription is dropped: detach, or the group being
        // unmanaged.
        loop {
            let sample = match (deferred, self.cooldown_ends()) {
                (Some(held), Some(deadline)) => tokio::select! {
                    next = samples.recv() => match next {
                        Some(sample) => sample,
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => held,
                },
                _ => match samples.recv().await {
                    Some(sample) => sample,
                    None => break,
                },
            };
            let Some(group) = self.group.upgrade() else {
                break;
            };

            deferred = None;
            match self.step(&group, sample).await {
                Step::Deferred => deferred = Some(sample),
                Step::Attempted => {
                    let mut dropped = 0usize;
                    while samples.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        debug!(group = %group.id(), dropped, "metric updates during resize ignored");
                    }
                }
                Step::Idle => {}
            }
        }
        debug!(metric = %self.policy.metric, "autoscaler control loop finished");
    }

    async fn step(&mut self, group: &Arc<Entity>, sample: f64) -> Step {
        if group.lifecycle() != Lifecycle::Running {
            trace!(group = %group.id(), state = %group.lifecycle(), "group not running, sample ignored");
            return Step::Idle;
        }
        if self.in_cooldown() {
            trace!(group = %group.id(), "in cooldown, sample held");
            return Step::Deferred;
        }

        let (current, bounds) = match (group.current_size(), group.size_range()) {
            (Ok(current), Ok(bounds)) => (current, bounds),
            (Err(e), _) | (_, Err(e)) => {
                warn!(group = %group.id(), error = %e, "cannot read group size");
                return Step::Idle;
            }
        };
        let ScaleDecision::ScaleTo(target) =
            self.policy.evaluate(&group.label(), current, bounds, sample)
        else {
            return Step::Idle;
        };

        self.requests.fetch_add(1, Ordering::SeqCst);
        match group.resize(target).await {
            Ok(outcome) => {
                self.last_resize = Some(Instant::now());
                if outcome.is_partial() {
                    warn!(
                        group = %group.id(),
                        target,
                        achieved = outcome.achieved,
                        failures = outcome.failures,
                        "autoscaler resize partially failed"
                    );
                } else {
                    info!(group = %group.id(), from = outcome.from, to = outcome.achieved, "autoscaler resized group");
                }
            }
            Err(EntityError::ResizeInProgress { .. }) => {
                debug!(group = %group.id(), target, "another resize in progress, sample ignored");
            }
            Err(e) => warn!(group = %group.id(), target, error = %e, "autoscaler resize failed"),
        }
        Step::Attempted
    }
}

/// A live policy. Dropping the handle leaves the policy attached; call
/// `detach` to remove it.
pub struct PolicyHandle {
    name: String,
    requests: Arc<AtomicU64>,
    bus: Weak<SubscriptionBus>,
    subscription: SubscriptionHandle,
    task: JoinHandle<()>,
}

impl PolicyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of resizes the policy has asked the group for.
    pub fn resize_requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop observing the metric. A resize already in flight runs to
    /// completion.
    pub fn detach(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.subscription);
        }
        info!(policy = %self.name, "autoscaler detached");
    }
}

impl std::fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PolicyHandle({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tiergrid_entity::sensor::GROUP_SIZE;
    use tiergrid_entity::{EntityBlueprint, EntityResult, Location, Startable};
    use tiergrid_group::{BlueprintFactory, DynamicGroup, INITIAL_SIZE, MAX_SIZE, MIN_SIZE};

    const METRIC: &str = "webapp.reqs.per_sec.windowed";

    fn policy() -> AutoscalerPolicy {
        AutoscalerPolicy::new(METRIC).metric_range(10.0, 100.0)
    }

    #[test]
    fn desired_size_uses_midpoint() {
        let p = policy();
        // mid = 55
        assert_eq!(p.desired_size(2, 50.0), None);
        assert_eq!(p.desired_size(2, 150.0), Some(6));
        assert_eq!(p.desired_size(4, 5.0), Some(1));
        assert_eq!(p.desired_size(0, 110.0), Some(2));
        assert_eq!(p.desired_size(0, 5.0), Some(0));
        assert_eq!(p.desired_size(3, -20.0), Some(0));
    }

    #[test]
    fn evaluate_clamps_and_skips_no_ops() {
        let p = policy();
        let bounds = SizeRange::new(2, 5);
        assert_eq!(p.evaluate("web", 2, bounds, 150.0), ScaleDecision::ScaleTo(5));
        assert_eq!(p.evaluate("web", 5, bounds, 5.0), ScaleDecision::ScaleTo(2));
        assert_eq!(p.evaluate("web", 2, bounds, 5.0), ScaleDecision::NoChange);
        assert_eq!(p.evaluate("web", 5, bounds, 500.0), ScaleDecision::NoChange);
        assert_eq!(p.evaluate("web", 3, bounds, 60.0), ScaleDecision::NoChange);
    }

    #[test]
    fn from_spec_parses_cooldown() {
        let spec = PolicySpec::Autoscaler {
            metric: METRIC.into(),
            metric_range: (10.0, 100.0),
            cooldown: "30s".into(),
        };
        let p = AutoscalerPolicy::from_spec(&spec).unwrap();
        assert_eq!(p.cooldown, Duration::from_secs(30));
        assert_eq!(p.metric(), METRIC);

        let bad = PolicySpec::Autoscaler {
            metric: METRIC.into(),
            metric_range: (10.0, 100.0),
            cooldown: "soon".into(),
        };
        assert!(matches!(
            AutoscalerPolicy::from_spec(&bad),
            Err(AutoscaleError::InvalidCooldown(_))
        ));
    }

    struct SlowStart(Duration);

    #[async_trait]
    impl Startable for SlowStart {
        async fn start(&self, _entity: &Arc<Entity>, _location: &Location) -> EntityResult<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        async fn stop(&self, _entity: &Arc<Entity>) -> EntityResult<()> {
            Ok(())
        }
    }

    fn cluster(ctx: &OrchestrationContext, member_delay: Duration) -> Arc<Entity> {
        let member = EntityBlueprint::new("web-server")
            .with_startable(Arc::new(SlowStart(member_delay)));
        let factory = Arc::new(BlueprintFactory::new(member));
        ctx.create_entity(
            DynamicGroup::blueprint(ctx, "dynamic-cluster", factory)
                .named("web")
                .configure(&INITIAL_SIZE, 2)
                .configure(&MIN_SIZE, 2)
                .configure(&MAX_SIZE, 5),
        )
        .unwrap()
    }

    fn record_sizes(ctx: &OrchestrationContext, group: &Entity) -> Arc<Mutex<Vec<u64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.subscribe(group.id(), GROUP_SIZE.name(), move |e| {
            if let Some(n) = e.value.as_u64() {
                sink.lock().push(n);
            }
        });
        seen
    }

    async fn settle_at(group: &Entity, size: u32) {
        for _ in 0..200 {
            if group.current_size().unwrap() == size {
                // let the control loop finish the resize
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("group never reached size {size}");
    }

    #[tokio::test]
    async fn oscillating_metric_stays_within_bounds() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        group.start(Location::localhost()).await.unwrap();
        let sizes = record_sizes(&ctx, &group);
        let handle = policy().attach(&ctx, &group).unwrap();

        for _ in 0..3 {
            group.set_sensor_value(METRIC, json!(150));
            settle_at(&group, 5).await;
            group.set_sensor_value(METRIC, json!(5));
            settle_at(&group, 2).await;
        }

        assert!(sizes.lock().iter().all(|n| (2..=5).contains(n)));
        assert_eq!(handle.resize_requests(), 6);
        handle.detach();
    }

    #[tokio::test]
    async fn updates_during_a_resize_are_ignored() {
        let ctx = OrchestrationContext::new();
        let slow = cluster(&ctx, Duration::from_millis(300));
        slow.start(Location::localhost()).await.unwrap();
        let handle = policy().attach(&ctx, &slow).unwrap();

        // 2 * 120 / 55 rounds up to 5
        slow.set_sensor_value(METRIC, json!(120));
        tokio::time::sleep(Duration::from_millis(20)).await;
        for v in [130, 140, 150, 160] {
            slow.set_sensor_value(METRIC, json!(v));
        }
        assert_eq!(slow.current_size().unwrap(), 2);
        assert_eq!(handle.resize_requests(), 1);
        settle_at(&slow, 5).await;

        assert_eq!(handle.resize_requests(), 1);
    }

    #[tokio::test]
    async fn cooldown_runs_from_completion() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        group.start(Location::localhost()).await.unwrap();
        let handle = policy()
            .cooldown(Duration::from_secs(60))
            .attach(&ctx, &group)
            .unwrap();

        group.set_sensor_value(METRIC, json!(150));
        settle_at(&group, 5).await;
        group.set_sensor_value(METRIC, json!(5));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(group.current_size().unwrap(), 5);
        assert_eq!(handle.resize_requests(), 1);
    }

    #[tokio::test]
    async fn sample_held_during_cooldown_is_evaluated_when_it_ends() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        group.start(Location::localhost()).await.unwrap();
        let handle = policy()
            .cooldown(Duration::from_millis(200))
            .attach(&ctx, &group)
            .unwrap();

        group.set_sensor_value(METRIC, json!(150));
        settle_at(&group, 5).await;
        // arrives inside the cooldown and is the last sample published
        group.set_sensor_value(METRIC, json!(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(group.current_size().unwrap(), 5);
        assert_eq!(handle.resize_requests(), 1);

        settle_at(&group, 2).await;
        assert_eq!(handle.resize_requests(), 2);
    }

    #[tokio::test]
    async fn newest_held_sample_wins() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        group.start(Location::localhost()).await.unwrap();
        let handle = policy()
            .cooldown(Duration::from_millis(200))
            .attach(&ctx, &group)
            .unwrap();

        group.set_sensor_value(METRIC, json!(150));
        settle_at(&group, 5).await;
        group.set_sensor_value(METRIC, json!(5));
        group.set_sensor_value(METRIC, json!(60));
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(group.current_size().unwrap(), 5);
        assert_eq!(handle.resize_requests(), 1);
    }

    #[tokio::test]
    async fn acts_only_while_running() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        let handle = policy().attach(&ctx, &group).unwrap();

        group.set_sensor_value(METRIC, json!(150));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.resize_requests(), 0);
        assert_eq!(group.current_size().unwrap(), 0);
    }

    #[tokio::test]
    async fn current_value_is_evaluated_on_attach() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        group.start(Location::localhost()).await.unwrap();
        group.set_sensor_value(METRIC, json!(150));

        let handle = policy().attach(&ctx, &group).unwrap();
        settle_at(&group, 5).await;
        assert_eq!(handle.resize_requests(), 1);
    }

    #[tokio::test]
    async fn detach_stops_the_control_loop() {
        let ctx = OrchestrationContext::new();
        let group = cluster(&ctx, Duration::ZERO);
        group.start(Location::localhost()).await.unwrap();
        let handle = policy().attach(&ctx, &group).unwrap();
        handle.detach();

        group.set_sensor_value(METRIC, json!(150));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(group.current_size().unwrap(), 2);
        assert_eq!(ctx.bus().subscriber_count(group.id(), METRIC), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_attachments() {
        let ctx = OrchestrationContext::new();
        let plain = ctx.create_entity(EntityBlueprint::new("basic")).unwrap();
        assert!(matches!(
            policy().attach(&ctx, &plain),
            Err(AutoscaleError::NotResizable { .. })
        ));

        let group = cluster(&ctx, Duration::ZERO);
        assert!(matches!(
            AutoscalerPolicy::new(METRIC).metric_range(100.0, 10.0).attach(&ctx, &group),
            Err(AutoscaleError::InvalidRange { .. })
        ));
    }
}
