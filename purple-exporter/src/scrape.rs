//! One scrape cycle: fetch every sensor concurrently and publish the results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::mapping::{publish_scrape_result, publish_status};
use crate::registry::{MetricsRegistry, SharedRegistry};
use crate::sensor::SensorSource;

/// Outcome of fetching one sensor during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorOutcome {
    /// The sensor answered and its metrics were updated.
    Updated,
    /// The fetch failed; the sensor's previous values are left in place.
    Failed(String),
}

/// Summary of one completed scrape cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Outcome per sensor address.
    pub outcomes: HashMap<String, SensorOutcome>,
    /// Wall time of the whole cycle.
    pub duration: Duration,
}

impl CycleReport {
    /// Number of sensors updated in this cycle.
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, SensorOutcome::Updated))
            .count()
    }

    /// Number of sensors that failed in this cycle.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Fetches all configured sensors and writes their status into the registry.
pub struct ScrapeCycle<S> {
    source: Arc<S>,
    registry: SharedRegistry,
    addresses: Arc<[String]>,
    prefix: Arc<str>,
}

impl<S: SensorSource> ScrapeCycle<S> {
    /// Create a cycle over a fixed set of sensor addresses.
    ///
    /// Repeated addresses are polled once, in order of first appearance.
    pub fn new(
        source: Arc<S>,
        registry: SharedRegistry,
        mut addresses: Vec<String>,
        prefix: &str,
    ) -> Self {
        let mut seen = HashSet::with_capacity(addresses.len());
        addresses.retain(|address| seen.insert(address.clone()));

        Self {
            source,
            registry,
            addresses: addresses.into(),
            prefix: prefix.into(),
        }
    }

    /// The sensor addresses this cycle polls.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Run one cycle to completion.
    ///
    /// Every sensor is fetched in its own task and the cycle waits for all of
    /// them. A failing or panicking fetch only affects its own sensor.
    pub async fn run(&self) -> CycleReport {
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        let mut task_addresses = HashMap::with_capacity(self.addresses.len());

        for address in self.addresses.iter() {
            let source = self.source.clone();
            let registry = self.registry.clone();
            let prefix = self.prefix.clone();
            let address = address.clone();

            let handle = tasks.spawn({
                let address = address.clone();
                async move { scrape_one(source.as_ref(), &registry, &prefix, &address).await }
            });
            task_addresses.insert(handle.id(), address);
        }

        let mut outcomes = HashMap::with_capacity(task_addresses.len());

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, Ok(()))) => {
                    if let Some(address) = task_addresses.remove(&id) {
                        outcomes.insert(address, SensorOutcome::Updated);
                    }
                }
                Ok((id, Err(reason))) => {
                    if let Some(address) = task_addresses.remove(&id) {
                        warn!(address = %address, error = %reason, "Sensor fetch failed");
                        outcomes.insert(address, SensorOutcome::Failed(reason));
                    }
                }
                Err(e) => {
                    let reason = if e.is_panic() {
                        "fetch task panicked".to_string()
                    } else {
                        "fetch task cancelled".to_string()
                    };
                    if let Some(address) = task_addresses.remove(&e.id()) {
                        error!(address = %address, error = %reason, "Sensor fetch task failed");
                        if let Err(err) = publish_scrape_result(
                            &self.registry,
                            &self.prefix,
                            &address,
                            0.0,
                            None,
                        ) {
                            error!(address = %address, error = %err, "Failed to record scrape result");
                        }
                        outcomes.insert(address, SensorOutcome::Failed(reason));
                    }
                }
            }
        }

        let report = CycleReport {
            outcomes,
            duration: started.elapsed(),
        };

        self.registry
            .record_cycle(report.succeeded(), report.failed());

        debug!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "Scrape cycle complete"
        );

        report
    }
}

/// Fetch one sensor and publish what it returned.
async fn scrape_one<S: SensorSource>(
    source: &S,
    registry: &MetricsRegistry,
    prefix: &str,
    address: &str,
) -> Result<(), String> {
    let started = Instant::now();
    let result = source.fetch(address).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(status) => {
            debug!(
                address,
                host = %status.sensor_id,
                place = %status.place,
                "Sensor status received"
            );
            publish_status(registry, prefix, address, &status).map_err(|e| e.to_string())?;
            publish_scrape_result(registry, prefix, address, elapsed, Some(unix_now()))
                .map_err(|e| e.to_string())
        }
        Err(e) => {
            if let Err(err) = publish_scrape_result(registry, prefix, address, elapsed, None) {
                error!(address, error = %err, "Failed to record scrape result");
            }
            Err(e.to_string())
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{self, register_metrics};
    use crate::sensor::{FetchError, SensorStatus};
    use parking_lot::Mutex;

    /// Sensor source that answers from a fixed table.
    #[derive(Default)]
    struct FakeSource {
        responses: Mutex<HashMap<String, Option<SensorStatus>>>,
        delays: HashMap<String, Duration>,
    }

    impl FakeSource {
        fn set(&self, address: &str, status: Option<SensorStatus>) {
            self.responses.lock().insert(address.to_string(), status);
        }
    }

    impl SensorSource for FakeSource {
        async fn fetch(&self, address: &str) -> Result<SensorStatus, FetchError> {
            if let Some(delay) = self.delays.get(address) {
                tokio::time::sleep(*delay).await;
            }
            if address == "panic:80" {
                panic!("sensor exploded");
            }
            let response = self.responses.lock().get(address).cloned().flatten();
            response.ok_or_else(|| FetchError::Status {
                address: address.to_string(),
                status: 500,
            })
        }
    }

    fn make_status(sensor_id: &str, temp: f64) -> SensorStatus {
        SensorStatus {
            sensor_id: sensor_id.to_string(),
            version: "7.0".to_string(),
            temperature_f: temp,
            pm25_aqi_a: 12.0,
            pm25_aqi_b: 11.5,
            ..Default::default()
        }
    }

    fn make_registry() -> SharedRegistry {
        let registry = Arc::new(MetricsRegistry::new(""));
        register_metrics(&registry, "").unwrap();
        registry
    }

    fn make_cycle(source: Arc<FakeSource>, registry: SharedRegistry, addrs: &[&str]) -> ScrapeCycle<FakeSource> {
        ScrapeCycle::new(
            source,
            registry,
            addrs.iter().map(|a| a.to_string()).collect(),
            "",
        )
    }

    #[tokio::test]
    async fn test_cycle_updates_all_sensors() {
        let source = Arc::new(FakeSource::default());
        source.set("a:80", Some(make_status("aaa", 70.0)));
        source.set("b:80", Some(make_status("bbb", 60.0)));
        let registry = make_registry();

        let report = make_cycle(source, registry.clone(), &["a:80", "b:80"]).run().await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["aaa"]), Some(70.0));
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["bbb"]), Some(60.0));
        assert_eq!(registry.get_gauge(mapping::SENSOR_UP, &["a:80"]), Some(1.0));
        assert_eq!(registry.stats().cycles_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_sensor_is_isolated() {
        let source = Arc::new(FakeSource::default());
        source.set("good:80", Some(make_status("good", 72.5)));
        source.set("bad:80", None);
        let registry = make_registry();

        let report = make_cycle(source, registry.clone(), &["good:80", "bad:80"])
            .run()
            .await;

        assert_eq!(report.outcomes["good:80"], SensorOutcome::Updated);
        assert!(matches!(report.outcomes["bad:80"], SensorOutcome::Failed(_)));
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["good"]), Some(72.5));
        assert_eq!(registry.get_gauge(mapping::SENSOR_UP, &["bad:80"]), Some(0.0));
        assert_eq!(registry.stats().fetch_failures, 1);
        assert_eq!(registry.stats().fetch_successes, 1);
    }

    #[tokio::test]
    async fn test_repeated_address_polled_once() {
        let source = Arc::new(FakeSource::default());
        source.set("a:80", Some(make_status("aaa", 70.0)));
        source.set("bad:80", None);
        let registry = make_registry();

        let cycle = make_cycle(source, registry.clone(), &["a:80", "bad:80", "a:80", "bad:80"]);
        assert_eq!(cycle.addresses(), ["a:80".to_string(), "bad:80".to_string()]);

        let report = cycle.run().await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(registry.stats().fetch_successes, 1);
        assert_eq!(registry.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_isolated() {
        let source = Arc::new(FakeSource::default());
        source.set("good:80", Some(make_status("good", 72.5)));
        let registry = make_registry();

        let report = make_cycle(source, registry.clone(), &["good:80", "panic:80"])
            .run()
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            report.outcomes["panic:80"],
            SensorOutcome::Failed("fetch task panicked".to_string())
        );
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["good"]), Some(72.5));
        assert_eq!(
            registry.get_gauge(mapping::SENSOR_UP, &["panic:80"]),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_values() {
        let source = Arc::new(FakeSource::default());
        source.set("s:80", Some(make_status("abc123", 72.5)));
        let registry = make_registry();
        let cycle = make_cycle(source.clone(), registry.clone(), &["s:80"]);

        cycle.run().await;
        source.set("s:80", None);
        let report = cycle.run().await;

        assert_eq!(report.failed(), 1);
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["abc123"]), Some(72.5));
        assert_eq!(registry.get_gauge(mapping::SENSOR_UP, &["s:80"]), Some(0.0));
        assert!(
            registry
                .get_gauge(mapping::SENSOR_LAST_SUCCESS, &["s:80"])
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let source = Arc::new(FakeSource::default());
        source.set("s:80", Some(make_status("abc123", 72.5)));
        let registry = make_registry();
        let cycle = make_cycle(source.clone(), registry.clone(), &["s:80"]);

        cycle.run().await;
        source.set("s:80", Some(make_status("abc123", 65.0)));
        cycle.run().await;

        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["abc123"]), Some(65.0));
    }

    #[tokio::test]
    async fn test_identical_cycles_are_idempotent() {
        let source = Arc::new(FakeSource::default());
        source.set("s:80", Some(make_status("abc123", 72.5)));
        let registry = make_registry();
        let cycle = make_cycle(source, registry.clone(), &["s:80"]);

        let snapshot = |r: &MetricsRegistry| {
            [
                r.get_gauge(mapping::TEMP_F, &["abc123"]),
                r.get_gauge(mapping::PM25_AQI, &["abc123", "a"]),
                r.get_gauge(mapping::PM25_AQI, &["abc123", "b"]),
                r.get_gauge(mapping::SENSOR_ID, &["abc123", "abc123"]),
            ]
        };

        cycle.run().await;
        let first = snapshot(registry.as_ref());
        let first_count = registry.series_count();
        cycle.run().await;

        assert_eq!(snapshot(registry.as_ref()), first);
        assert_eq!(registry.series_count(), first_count);
    }

    #[tokio::test]
    async fn test_slow_sensor_delays_but_does_not_block_others() {
        let mut source = FakeSource::default();
        source
            .delays
            .insert("slow:80".to_string(), Duration::from_millis(200));
        source.set("slow:80", Some(make_status("slow", 1.0)));
        source.set("fast:80", Some(make_status("fast", 2.0)));
        let registry = make_registry();

        let report = make_cycle(Arc::new(source), registry.clone(), &["slow:80", "fast:80"])
            .run()
            .await;

        assert_eq!(report.succeeded(), 2);
        assert!(report.duration >= Duration::from_millis(200));
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["slow"]), Some(1.0));
        assert_eq!(registry.get_gauge(mapping::TEMP_F, &["fast"]), Some(2.0));
    }
}
