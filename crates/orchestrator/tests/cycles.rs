//! End-to-end cycles against the in-memory store with fake collectors.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use forecast_verify_collectors::CollectorRegistry;
use forecast_verify_core::{
    AccuracyMetric, AppConfig, CollectError, DeviationFilter, DeviationStore, ForecastBinding, ForecastCollector,
    Location, MetricFilter, MetricStore, ModelConfig, ObservationBinding, ObservationCollector,
    ObservationSourceConfig, Parameter, ParsingError, RateLimitConfig, RawReading, RetryConfig,
    RunSchedule, StoreError, TimeWindow,
};
use forecast_verify_data::MemoryStore;
use forecast_verify_orchestrator::{
    CycleReport, CycleRunner, JobKind, JobRegistry, JobStatus, Orchestrator, Stores,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Fakes
// ============================================================================

enum Behaviour {
    /// Forecast `(lead hours, value)` pairs for every location
    Values(Vec<(i64, Parameter, Decimal)>),
    Broken,
    Hang,
    Panic,
}

struct FakeForecast {
    model_id: String,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl FakeForecast {
    fn new(model_id: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            model_id: model_id.to_string(),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ForecastCollector for FakeForecast {
    fn source_id(&self) -> &str {
        "open_meteo"
    }

    async fn fetch_forecast(
        &self,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Values(values) => Ok(values
                .iter()
                .map(|(lead, parameter, value)| {
                    RawReading::forecast(
                        &location.id,
                        *parameter,
                        *value,
                        "open_meteo",
                        &self.model_id,
                        run_time,
                        run_time + Duration::hours(*lead),
                    )
                })
                .collect()),
            Behaviour::Broken => Err(ParsingError::new("open_meteo", "missing hourly block").into()),
            Behaviour::Panic => panic!("index out of bounds: the len is 5 but the index is 5"),
            Behaviour::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

struct FakeObservation {
    readings: Vec<(DateTime<Utc>, Parameter, Decimal)>,
    calls: AtomicUsize,
}

#[async_trait]
impl ObservationCollector for FakeObservation {
    fn source_id(&self) -> &str {
        "pioupiou"
    }

    async fn fetch_observation(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<RawReading>, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .readings
            .iter()
            .filter(|(at, ..)| window.contains(*at))
            .map(|(at, parameter, value)| RawReading::observation(&location.id, *parameter, *value, "pioupiou", *at))
            .collect())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, hour, minute, 0).unwrap()
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.locations = vec![Location::new("planfait", "Planfait", 45.85, 6.22).with_station("pioupiou", "110")];
    config
}

fn model(id: &str) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        name: id.to_uppercase(),
        collector: ForecastBinding::OpenMeteo {
            base_url: "http://unused".into(),
            model: id.to_string(),
            domain: None,
        },
        runs: RunSchedule::default(),
        parameters: vec![Parameter::WindSpeed, Parameter::Temperature],
        rate_limit: RateLimitConfig::default(),
        retry: RetryConfig::default(),
        fallback: None,
    }
}

fn source() -> ObservationSourceConfig {
    ObservationSourceConfig {
        id: "pioupiou".into(),
        name: "Pioupiou".into(),
        collector: ObservationBinding::Pioupiou {
            base_url: "http://unused".into(),
        },
        parameters: vec![Parameter::WindSpeed, Parameter::Temperature],
        rate_limit: RateLimitConfig::default(),
        retry: RetryConfig::default(),
        fallback: None,
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<MemoryStore>,
    observations: Arc<FakeObservation>,
}

fn harness(
    models: Vec<(&str, Arc<FakeForecast>)>,
    observations: Vec<(DateTime<Utc>, Parameter, Decimal)>,
) -> Harness {
    let config = config();
    let mut registry = CollectorRegistry::new();
    for (id, collector) in models {
        registry.register_model(model(id), collector);
    }
    let observations = Arc::new(FakeObservation {
        readings: observations,
        calls: AtomicUsize::new(0),
    });
    registry.register_source(source(), observations.clone());

    let store = Arc::new(MemoryStore::new());
    let runner = CycleRunner::new(&config, registry, Stores::shared(store.clone()))
        .unwrap()
        .with_source_timeout(std::time::Duration::from_secs(5));
    Harness {
        orchestrator: Orchestrator::new(runner, JobRegistry::from_schedule(&config.schedule)),
        store,
        observations,
    }
}

// Default run schedule publishes 06z at 09:00, so at 09:30 the 06z run is current.
fn forecast_time() -> DateTime<Utc> {
    at(1, 9, 30)
}

fn wind(value: Decimal) -> Behaviour {
    Behaviour::Values(vec![(6, Parameter::WindSpeed, value), (70, Parameter::WindSpeed, value)])
}

async fn trigger(h: &Harness, kind: JobKind, now: DateTime<Utc>) -> CycleReport {
    h.orchestrator.trigger_at(kind, now).await.unwrap().unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_end_to_end() {
    let h = harness(
        vec![("arome", FakeForecast::new("arome", wind(dec!(25))))],
        vec![(at(1, 12, 5), Parameter::WindSpeed, dec!(18))],
    );

    let CycleReport::Forecast(forecast) = trigger(&h, JobKind::Forecast, forecast_time()).await else {
        panic!("expected forecast report");
    };
    // the 70 h lead is beyond every horizon bucket and is not staged
    assert_eq!(forecast.staged, 1);
    assert_eq!(h.store.staged_count().await, 1);

    let CycleReport::Observation(obs) = trigger(&h, JobKind::Observation, at(1, 13, 0)).await else {
        panic!("expected observation report");
    };
    assert_eq!(obs.tally.deviations_written, 1);
    assert_eq!(obs.tally.released, 1);

    let deviations = h.store.deviations(&DeviationFilter::default()).await.unwrap();
    assert_eq!(deviations.len(), 1);
    let d = &deviations[0];
    assert_eq!(d.horizon, 6);
    assert_eq!(d.deviation, dec!(-7));
    assert_eq!(d.timestamp, at(1, 12, 0));
    assert_eq!(d.run_time, at(1, 6, 0));
    assert_eq!(d.observed_at, at(1, 12, 5));
    assert_eq!(h.store.staged_count().await, 0);
}

#[tokio::test]
async fn test_scenario_e_one_broken_source_does_not_block_others() {
    let broken = FakeForecast::new("icon_d2", Behaviour::Broken);
    let h = harness(
        vec![
            ("arome", FakeForecast::new("arome", wind(dec!(25)))),
            ("icon_d2", broken.clone()),
            ("ecmwf", FakeForecast::new("ecmwf", wind(dec!(20)))),
        ],
        vec![(at(1, 12, 5), Parameter::WindSpeed, dec!(18))],
    );

    let report = trigger(&h, JobKind::Forecast, forecast_time()).await;
    assert_eq!(report.status(), JobStatus::Succeeded);
    let failed: Vec<_> = report.sources().iter().filter(|s| s.status == JobStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source, "icon_d2");
    assert_eq!(failed[0].readings, 0);
    assert_eq!(failed[0].failed_locations, vec!["planfait".to_string()]);
    assert!(failed[0].error.as_deref().unwrap().contains("missing hourly block"));
    assert_eq!(broken.calls.load(Ordering::SeqCst), 1);

    trigger(&h, JobKind::Observation, at(1, 13, 0)).await;
    let mut models: Vec<String> = h
        .store
        .deviations(&DeviationFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.model_id)
        .collect();
    models.sort();
    assert_eq!(models, vec!["arome", "ecmwf"]);
}

#[tokio::test]
async fn test_repeated_invocation_yields_one_deviation() {
    let arome = FakeForecast::new("arome", wind(dec!(25)));
    let h = harness(
        vec![("arome", arome.clone())],
        vec![(at(1, 12, 5), Parameter::WindSpeed, dec!(18))],
    );

    trigger(&h, JobKind::Forecast, forecast_time()).await;
    // already staged: no second fetch
    trigger(&h, JobKind::Forecast, forecast_time()).await;
    assert_eq!(arome.calls.load(Ordering::SeqCst), 1);

    trigger(&h, JobKind::Observation, at(1, 13, 0)).await;
    // staging is empty now, the deviation marks the run as collected
    trigger(&h, JobKind::Forecast, forecast_time() + Duration::minutes(10)).await;
    assert_eq!(arome.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.staged_count().await, 0);

    trigger(&h, JobKind::Observation, at(1, 13, 30)).await;
    assert_eq!(h.store.deviation_count().await, 1);
}

#[tokio::test]
async fn test_observation_skipped_without_pending_forecasts() {
    let h = harness(
        vec![("arome", FakeForecast::new("arome", wind(dec!(25))))],
        vec![(at(1, 12, 5), Parameter::WindSpeed, dec!(18))],
    );

    let CycleReport::Observation(obs) = trigger(&h, JobKind::Observation, at(1, 13, 0)).await else {
        panic!("expected observation report");
    };
    assert_eq!(h.observations.calls.load(Ordering::SeqCst), 0);
    assert_eq!(obs.sources[0].skipped_locations, 1);
    assert_eq!(obs.sources[0].status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_scenario_b_late_observation_then_retention_expiry() {
    let h = harness(
        vec![("arome", FakeForecast::new("arome", wind(dec!(25))))],
        vec![(at(1, 13, 0), Parameter::WindSpeed, dec!(18))],
    );

    trigger(&h, JobKind::Forecast, forecast_time()).await;
    let CycleReport::Observation(obs) = trigger(&h, JobKind::Observation, at(1, 14, 0)).await else {
        panic!("expected observation report");
    };
    assert_eq!(obs.tally.pairs, 0);
    assert_eq!(obs.tally.unmatched_observations, 1);
    assert_eq!(h.store.deviation_count().await, 0);
    assert_eq!(h.store.staged_count().await, 1);

    // target 12:00 + 72 h retention
    let CycleReport::Purge { purged } = trigger(&h, JobKind::Purge, at(4, 12, 1)).await else {
        panic!("expected purge report");
    };
    assert_eq!(purged, 1);
    assert_eq!(h.store.staged_count().await, 0);
}

#[tokio::test]
async fn test_scenario_c_sanity_violation_writes_nothing() {
    let h = harness(
        vec![(
            "arome",
            FakeForecast::new("arome", Behaviour::Values(vec![(6, Parameter::Temperature, dec!(20))])),
        )],
        vec![(at(1, 12, 0), Parameter::Temperature, dec!(85))],
    );

    trigger(&h, JobKind::Forecast, forecast_time()).await;
    let CycleReport::Observation(obs) = trigger(&h, JobKind::Observation, at(1, 13, 0)).await else {
        panic!("expected observation report");
    };
    assert_eq!(obs.tally.pairs, 1);
    assert_eq!(obs.tally.sanity_violations, 1);
    assert_eq!(obs.tally.deviations_written, 0);
    assert_eq!(h.store.deviation_count().await, 0);
}

#[tokio::test]
async fn test_metrics_cycle_replaces_metrics() {
    let h = harness(
        vec![("arome", FakeForecast::new("arome", wind(dec!(25))))],
        vec![(at(1, 12, 5), Parameter::WindSpeed, dec!(18))],
    );
    trigger(&h, JobKind::Forecast, forecast_time()).await;
    trigger(&h, JobKind::Observation, at(1, 13, 0)).await;

    let CycleReport::Metrics { metrics } = trigger(&h, JobKind::Metrics, at(2, 2, 0)).await else {
        panic!("expected metrics report");
    };
    // all, month and week buckets for one group
    assert_eq!(metrics, 3);

    let stored = h.store.metrics(&MetricFilter::default()).await.unwrap();
    let all = stored.iter().find(|m| m.bucket_start.is_none()).unwrap();
    assert!((all.bias + 7.0).abs() < 1e-9);
    assert!((all.mae - 7.0).abs() < 1e-9);
    assert!(all.bias_interval.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_source_times_out() {
    let h = harness(
        vec![
            ("arome", FakeForecast::new("arome", wind(dec!(25)))),
            ("slow", FakeForecast::new("slow", Behaviour::Hang)),
        ],
        Vec::new(),
    );

    let report = trigger(&h, JobKind::Forecast, forecast_time()).await;
    let slow = report.sources().iter().find(|s| s.source == "slow").unwrap();
    assert_eq!(slow.status, JobStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(h.store.staged_count().await, 1);
}

#[tokio::test]
async fn test_all_sources_failing_marks_job_failed() {
    let h = harness(
        vec![("icon_d2", FakeForecast::new("icon_d2", Behaviour::Broken))],
        Vec::new(),
    );
    let report = trigger(&h, JobKind::Forecast, forecast_time()).await;
    assert_eq!(report.status(), JobStatus::Failed);

    let state = h.orchestrator.jobs().state(JobKind::Forecast).await.unwrap();
    assert_eq!(state.status, JobStatus::Failed);
    assert!(state.last_finished.is_some());
}

#[tokio::test]
async fn test_panicking_collector_is_isolated_and_job_stays_usable() {
    let arome = FakeForecast::new("arome", wind(dec!(25)));
    let h = harness(
        vec![("arome", arome.clone()), ("wrf_alps", FakeForecast::new("wrf_alps", Behaviour::Panic))],
        Vec::new(),
    );

    let report = trigger(&h, JobKind::Forecast, forecast_time()).await;
    assert_eq!(report.status(), JobStatus::Succeeded);
    let crashed = report.sources().iter().find(|s| s.source == "wrf_alps").unwrap();
    assert_eq!(crashed.status, JobStatus::Failed);
    assert!(crashed.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(h.store.staged_count().await, 1);

    let state = h.orchestrator.jobs().state(JobKind::Forecast).await.unwrap();
    assert!(!state.is_running());

    // the next cycle is not suppressed
    let next = h.orchestrator.trigger_at(JobKind::Forecast, forecast_time() + Duration::hours(6)).await.unwrap();
    assert!(next.is_some());
}

struct PanickingMetrics;

#[async_trait]
impl MetricStore for PanickingMetrics {
    async fn replace_metrics(&self, _metrics: &[AccuracyMetric]) -> Result<(), StoreError> {
        panic!("metrics backend crashed");
    }

    async fn metrics(&self, _filter: &MetricFilter) -> Result<Vec<AccuracyMetric>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_panicking_cycle_is_reported_and_finished() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        staging: store.clone(),
        deviations: store,
        metrics: Arc::new(PanickingMetrics),
    };
    let runner = CycleRunner::new(&config, CollectorRegistry::new(), stores).unwrap();
    let orchestrator = Orchestrator::new(runner, JobRegistry::from_schedule(&config.schedule));

    let err = orchestrator.trigger_at(JobKind::Metrics, at(2, 2, 0)).await.unwrap_err();
    assert!(err.to_string().contains("metrics backend crashed"));

    let state = orchestrator.jobs().state(JobKind::Metrics).await.unwrap();
    assert_eq!(state.status, JobStatus::Failed);
    assert!(!state.is_running());
    assert!(state.last_finished.is_some());

    // a second attempt runs again instead of being suppressed
    assert!(orchestrator.trigger_at(JobKind::Metrics, at(3, 2, 0)).await.is_err());
}
