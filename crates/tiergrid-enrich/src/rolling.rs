//! Rolling time-window mean.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tiergrid_entity::{Entity, OrchestrationContext};
use tracing::{debug, warn};

use crate::enricher::{attach, EnricherHandle};

/// Numeric samples observed within the last `window`.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl RollingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record a sample taken at `at` and return the mean of the samples no
    /// older than `window` relative to `at`.
    pub fn push(&mut self, at: Instant, value: f64) -> f64 {
        self.samples.push_back((at, value));
        while let Some((oldest, _)) = self.samples.front() {
            if at.duration_since(*oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        // never empty: the new sample is always in the window
        let sum: f64 = self.samples.iter().map(|(_, v)| v).sum();
        sum / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Publish the windowed mean of `sensor` on `source` as `target_sensor` on
/// `target`. Non-numeric samples are skipped.
pub fn rolling_mean(
    ctx: &OrchestrationContext,
    source: &Entity,
    sensor: &str,
    target: &Arc<Entity>,
    target_sensor: &str,
    window: Duration,
) -> EnricherHandle {
    let name = format!(
        "rolling_mean({}:{sensor} -> {}:{target_sensor}, {window:?})",
        source.label(),
        target.label()
    );
    let samples = Mutex::new(RollingWindow::new(window));
    let weak: Weak<Entity> = Arc::downgrade(target);
    let out = target_sensor.to_string();
    let enricher = name.clone();
    let handle = attach(ctx, source, sensor, move |value| {
        let Some(target) = weak.upgrade() else {
            return;
        };
        let Some(sample) = value.as_f64() else {
            warn!(enricher = %enricher, %value, "non-numeric sample skipped");
            return;
        };
        let mut samples = samples.lock();
        let mean = samples.push(Instant::now(), sample);
        target.set_sensor_value(&out, serde_json::Value::from(mean));
    });
    debug!(enricher = %name, "enricher attached");
    EnricherHandle::from_subscriptions(name, Arc::downgrade(ctx.bus()), vec![handle])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiergrid_entity::EntityBlueprint;

    #[test]
    fn window_drops_old_samples() {
        let start = Instant::now();
        let mut w = RollingWindow::new(Duration::from_secs(10));
        assert_eq!(w.push(start, 10.0), 10.0);
        assert_eq!(w.push(start + Duration::from_secs(5), 20.0), 15.0);
        // the first sample is now 11s old
        assert_eq!(w.push(start + Duration::from_secs(11), 30.0), 25.0);
        assert_eq!(w.len(), 2);
        assert_eq!(w.push(start + Duration::from_secs(60), 4.0), 4.0);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn publishes_mean_of_window() {
        let ctx = OrchestrationContext::new();
        let web = ctx.create_entity(EntityBlueprint::new("web-server")).unwrap();
        let _e = rolling_mean(&ctx, &web, "reqs", &web, "reqs.windowed", Duration::from_secs(60));
        web.set_sensor_value("reqs", json!(10));
        web.set_sensor_value("reqs", json!(20));
        web.set_sensor_value("reqs", json!("n/a"));
        web.set_sensor_value("reqs", json!(30));
        assert_eq!(web.sensor_value("reqs.windowed"), Some(json!(20.0)));
    }
}
