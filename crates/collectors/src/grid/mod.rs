//! Bulk extraction of point forecasts from gridded model runs.
//!
//! A run is published as a handful of GRIB2 segments, each covering a range
//! of lead times. Every segment is downloaded once per run and interpolated
//! for all locations, so the request count does not grow with the number of
//! locations.

pub mod grib2;
pub mod interpolate;

use crate::resilience::ResilientClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_verify_core::{
    CollectError, ForecastBatch, ForecastCollector, GridGap, GridSegment, HorizonSet, Location,
    Parameter, ParsingError, RawReading, Unit,
};
use futures_util::future::join_all;
use grib2::{decode_messages, Grib2Field};
use interpolate::{bilinear, bilinear_direction, wind_from_components, Interpolated};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const SOURCE_ID: &str = "grid";

/// WMO code table 4.5: specified height above ground, ground surface.
const HEIGHT_ABOVE_GROUND: u8 = 103;
const GROUND: u8 = 1;

/// Discipline 0 (meteorological) parameters we read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridVariable {
    Temperature,
    WindDirection,
    WindSpeed,
    UComponent,
    VComponent,
    Gust,
}

impl GridVariable {
    fn from_codes(discipline: u8, category: u8, number: u8) -> Option<Self> {
        match (discipline, category, number) {
            (0, 0, 0) => Some(Self::Temperature),
            (0, 2, 0) => Some(Self::WindDirection),
            (0, 2, 1) => Some(Self::WindSpeed),
            (0, 2, 2) => Some(Self::UComponent),
            (0, 2, 3) => Some(Self::VComponent),
            (0, 2, 22) => Some(Self::Gust),
            _ => None,
        }
    }
}

/// Fields sharing one validity time.
#[derive(Default)]
struct TimeStep<'a> {
    fields: Vec<(GridVariable, &'a Grib2Field)>,
}

impl<'a> TimeStep<'a> {
    fn get(&self, variable: GridVariable) -> Option<&'a Grib2Field> {
        self.fields.iter().find(|(v, _)| *v == variable).map(|(_, f)| *f)
    }

    fn insert(&mut self, variable: GridVariable, field: &'a Grib2Field) {
        // first field per variable wins; further levels are ignored
        if self.get(variable).is_none() {
            self.fields.push((variable, field));
        }
    }
}

/// Expands `{date}` (YYYYMMDD) and `{hour}` (HH) in a segment path.
#[must_use]
pub fn expand_segment_path(path: &str, run_time: DateTime<Utc>) -> String {
    path.replace("{date}", &run_time.format("%Y%m%d").to_string())
        .replace("{hour}", &run_time.format("%H").to_string())
}

pub struct GridForecastCollector {
    client: ResilientClient,
    base_url: String,
    model_id: String,
    segments: Vec<GridSegment>,
    parameters: Vec<Parameter>,
    horizons: HorizonSet,
}

impl GridForecastCollector {
    #[must_use]
    pub fn new(
        client: ResilientClient,
        base_url: impl Into<String>,
        model_id: impl Into<String>,
        segments: Vec<GridSegment>,
        parameters: Vec<Parameter>,
        horizons: HorizonSet,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_id: model_id.into(),
            segments,
            parameters,
            horizons,
        }
    }

    async fn download(&self, segment: &GridSegment, run_time: DateTime<Utc>) -> Result<Vec<Grib2Field>, CollectError> {
        let url = format!(
            "{}/{}",
            self.base_url,
            expand_segment_path(&segment.path, run_time).trim_start_matches('/')
        );
        let bytes = self.client.get_bytes(&url).await?;
        let fields = decode_messages(SOURCE_ID, &bytes)?;

        if let Some(other) = fields.iter().find(|f| f.reference_time != run_time) {
            return Err(ParsingError::new(
                SOURCE_ID,
                format!(
                    "segment {} holds run {}, expected {}",
                    segment.name, other.reference_time, run_time
                ),
            )
            .into());
        }

        debug!(
            source = SOURCE_ID,
            model = %self.model_id,
            segment = %segment.name,
            bytes = bytes.len(),
            fields = fields.len(),
            "Decoded grid segment"
        );
        Ok(fields)
    }

    /// Downloads every segment concurrently, once each.
    async fn download_all(
        &self,
        run_time: DateTime<Utc>,
    ) -> Vec<(&GridSegment, Result<Vec<Grib2Field>, CollectError>)> {
        join_all(self.segments.iter().map(|segment| async move {
            (segment, self.download(segment, run_time).await)
        }))
        .await
    }

    fn extract(
        &self,
        fields: &[Grib2Field],
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, ParsingError> {
        let mut steps: BTreeMap<DateTime<Utc>, TimeStep<'_>> = BTreeMap::new();
        for field in fields {
            if field.surface_type != HEIGHT_ABOVE_GROUND && field.surface_type != GROUND {
                continue;
            }
            if let Some(variable) = GridVariable::from_codes(field.discipline, field.category, field.number) {
                steps.entry(field.valid_time).or_default().insert(variable, field);
            }
        }

        let mut readings = Vec::new();
        for (valid_time, step) in &steps {
            let elapsed = *valid_time - run_time;
            if elapsed.num_seconds() % 3600 != 0 {
                continue;
            }
            let lead = elapsed.num_hours();
            if lead < 0 || self.horizons.bucket_for(lead).is_none() {
                continue;
            }

            let wind = match (step.get(GridVariable::UComponent), step.get(GridVariable::VComponent)) {
                (Some(u), Some(v)) => {
                    match (self.sample(u, location)?, self.sample(v, location)?) {
                        (Some(u), Some(v)) => Some(wind_from_components(u, v)),
                        _ => None,
                    }
                }
                _ => None,
            };
            let has_components = step.get(GridVariable::UComponent).is_some()
                && step.get(GridVariable::VComponent).is_some();

            for &parameter in &self.parameters {
                let (raw, unit) = match parameter {
                    Parameter::WindSpeed if has_components => (wind.map(|(s, _)| s), Unit::MetresPerSecond),
                    Parameter::WindSpeed => (
                        self.sample_opt(step.get(GridVariable::WindSpeed), location)?,
                        Unit::MetresPerSecond,
                    ),
                    // direction is undefined in calm air
                    Parameter::WindDirection if has_components => (
                        wind.filter(|(s, _)| *s > 0.0).map(|(_, d)| d),
                        Unit::Degrees,
                    ),
                    Parameter::WindDirection => {
                        let raw = match step.get(GridVariable::WindDirection) {
                            Some(f) => self.resolve(
                                bilinear_direction(&f.grid, &f.values, location.latitude, location.longitude),
                                location,
                            )?,
                            None => None,
                        };
                        (raw, Unit::Degrees)
                    }
                    Parameter::WindGust => (
                        self.sample_opt(step.get(GridVariable::Gust), location)?,
                        Unit::MetresPerSecond,
                    ),
                    Parameter::Temperature => (
                        self.sample_opt(step.get(GridVariable::Temperature), location)?,
                        Unit::Kelvin,
                    ),
                };
                let Some(raw) = raw else {
                    continue;
                };
                readings.push(RawReading::forecast(
                    location.id.clone(),
                    parameter,
                    parameter.normalize(SOURCE_ID, raw, unit)?,
                    SOURCE_ID,
                    self.model_id.clone(),
                    run_time,
                    *valid_time,
                ));
            }
        }
        Ok(readings)
    }

    fn sample(&self, field: &Grib2Field, location: &Location) -> Result<Option<f64>, ParsingError> {
        self.resolve(
            bilinear(&field.grid, &field.values, location.latitude, location.longitude),
            location,
        )
    }

    fn sample_opt(&self, field: Option<&Grib2Field>, location: &Location) -> Result<Option<f64>, ParsingError> {
        field.map_or(Ok(None), |f| self.sample(f, location))
    }

    fn resolve(&self, value: Interpolated, location: &Location) -> Result<Option<f64>, ParsingError> {
        match value {
            Interpolated::Value(v) => Ok(Some(v)),
            Interpolated::Masked => Ok(None),
            Interpolated::Outside => Err(ParsingError::new(
                SOURCE_ID,
                format!("location {} lies outside the {} grid", location.id, self.model_id),
            )),
        }
    }
}

impl GridForecastCollector {
    /// Downloads the run once and extracts every location from it. Also
    /// returns the first segment error so a single-location caller can
    /// surface it with its original kind.
    async fn extract_run(
        &self,
        locations: &[Location],
        run_time: DateTime<Utc>,
    ) -> (ForecastBatch, Option<CollectError>) {
        let mut batch = ForecastBatch::default();
        let mut failed: BTreeMap<String, CollectError> = BTreeMap::new();
        let mut first_error = None;

        for (segment, result) in self.download_all(run_time).await {
            let fields = match result {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(
                        source = SOURCE_ID,
                        model = %self.model_id,
                        segment = %segment.name,
                        error = %e,
                        "Grid segment failed, recording gap"
                    );
                    batch.gaps.push(GridGap {
                        segment: segment.name.clone(),
                        steps: segment.steps.clone(),
                        error: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            for location in locations {
                match self.extract(&fields, location, run_time) {
                    Ok(readings) => batch.readings.extend(readings),
                    Err(e) => {
                        failed.entry(location.id.clone()).or_insert_with(|| e.into());
                    }
                }
            }
        }

        for (location_id, e) in failed {
            warn!(source = SOURCE_ID, location = %location_id, error = %e, "Grid extraction failed for location");
            batch.failures.push((location_id, e));
        }

        info!(
            source = SOURCE_ID,
            model = %self.model_id,
            run = %run_time,
            segments = self.segments.len(),
            gaps = batch.gaps.len(),
            locations = locations.len(),
            readings = batch.readings.len(),
            "Grid run extracted"
        );
        (batch, first_error)
    }
}

#[async_trait]
impl ForecastCollector for GridForecastCollector {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_forecast(
        &self,
        location: &Location,
        run_time: DateTime<Utc>,
    ) -> Result<Vec<RawReading>, CollectError> {
        let (mut batch, segment_error) = self.extract_run(std::slice::from_ref(location), run_time).await;
        if let Some((_, e)) = batch.failures.pop() {
            return Err(e);
        }
        match segment_error {
            Some(e) if batch.readings.is_empty() => Err(e),
            _ => Ok(batch.readings),
        }
    }

    async fn fetch_forecasts(&self, locations: &[Location], run_time: DateTime<Utc>) -> ForecastBatch {
        self.extract_run(locations, run_time).await.0
    }
}

#[cfg(test)]
mod tests {
    use super::grib2::encode::{message, FieldSpec};
    use super::grib2::LatLonGrid;
    use super::*;
    use crate::resilience::RetryPolicy;
    use chrono::TimeZone;
    use forecast_verify_core::{HorizonBucket, RateLimitConfig};
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn run() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    // 45.0N..46.0N, 6.0E..7.0E at 0.5 degrees, north to south
    fn grid() -> LatLonGrid {
        LatLonGrid {
            ni: 3,
            nj: 3,
            la1: 46.0,
            lo1: 6.0,
            la2: 45.0,
            lo2: 7.0,
            di: 0.5,
            dj: 0.5,
            scan_mode: 0,
        }
    }

    fn uniform(value: f64) -> Vec<Option<f64>> {
        vec![Some(value); 9]
    }

    fn segment(name: &str, steps: Vec<i64>) -> GridSegment {
        GridSegment {
            name: name.into(),
            path: format!("{{date}}/{{hour}}/{name}.grib2"),
            steps,
        }
    }

    fn collector(base_url: &str, parameters: Vec<Parameter>) -> GridForecastCollector {
        let client = ResilientClient::new(SOURCE_ID, &RateLimitConfig { requests_per_minute: 6000 }, RetryPolicy::none())
            .unwrap();
        GridForecastCollector::new(
            client,
            base_url,
            "arome",
            vec![segment("SP1_00H06H", vec![0, 6]), segment("SP1_07H12H", vec![7, 12])],
            parameters,
            HorizonSet::new(vec![HorizonBucket::new(6, 1), HorizonBucket::new(12, 1)]).unwrap(),
        )
    }

    fn locations(count: usize) -> Vec<Location> {
        (0..count)
            .map(|i| Location::new(format!("loc{i}"), format!("Loc {i}"), 45.1 + i as f64 * 0.1, 6.1 + i as f64 * 0.1))
            .collect()
    }

    fn first_segment() -> Vec<u8> {
        message(
            run(),
            &grid(),
            &[
                // lead 3 falls outside every bucket
                FieldSpec { category: 2, number: 2, forecast_hours: 3, values: uniform(1.0) },
                FieldSpec { category: 2, number: 2, forecast_hours: 6, values: uniform(-3.0) },
                FieldSpec { category: 2, number: 3, forecast_hours: 6, values: uniform(-4.0) },
                FieldSpec { category: 0, number: 0, forecast_hours: 6, values: uniform(288.0) },
            ],
        )
    }

    fn second_segment() -> Vec<u8> {
        message(
            run(),
            &grid(),
            &[
                FieldSpec { category: 2, number: 2, forecast_hours: 12, values: uniform(5.0) },
                FieldSpec { category: 2, number: 3, forecast_hours: 12, values: uniform(0.0) },
                FieldSpec { category: 0, number: 0, forecast_hours: 12, values: uniform(290.0) },
            ],
        )
    }

    #[test]
    fn test_expand_segment_path() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
        assert_eq!(expand_segment_path("{date}/{hour}/SP1.grib2", t), "20240601/18/SP1.grib2");
    }

    #[tokio::test]
    async fn test_download_count_independent_of_location_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_00H06H.grib2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(first_segment()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_07H12H.grib2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(second_segment()))
            .expect(1)
            .mount(&server)
            .await;

        let batch = collector(&server.uri(), vec![Parameter::WindSpeed, Parameter::WindDirection, Parameter::Temperature])
            .fetch_forecasts(&locations(5), run())
            .await;

        assert!(batch.gaps.is_empty());
        assert!(batch.failures.is_empty());
        // 5 locations x 2 leads x 3 parameters
        assert_eq!(batch.readings.len(), 30);

        let at6: Vec<_> = batch
            .readings
            .iter()
            .filter(|r| r.location_id == "loc0" && r.lead_hours() == Some(6))
            .collect();
        let speed = at6.iter().find(|r| r.parameter == Parameter::WindSpeed).unwrap();
        assert_eq!(speed.value, dec!(18.0));
        let direction = at6.iter().find(|r| r.parameter == Parameter::WindDirection).unwrap();
        assert_eq!(direction.value, dec!(36.9));
        let temperature = at6.iter().find(|r| r.parameter == Parameter::Temperature).unwrap();
        assert_eq!(temperature.value, dec!(14.9));

        let westerly = batch
            .readings
            .iter()
            .find(|r| r.location_id == "loc0" && r.lead_hours() == Some(12) && r.parameter == Parameter::WindDirection)
            .unwrap();
        assert_eq!(westerly.value, dec!(270.0));
        assert!(batch.readings.iter().all(|r| r.source_id == SOURCE_ID));
    }

    #[tokio::test]
    async fn test_failed_segment_becomes_gap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_00H06H.grib2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(first_segment()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_07H12H.grib2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let batch = collector(&server.uri(), vec![Parameter::WindSpeed])
            .fetch_forecasts(&locations(2), run())
            .await;

        assert_eq!(batch.gaps.len(), 1);
        assert_eq!(batch.gaps[0].segment, "SP1_07H12H");
        assert_eq!(batch.gaps[0].steps, vec![7, 12]);
        assert_eq!(batch.readings.len(), 2);
        assert!(!batch.is_total_failure());
    }

    #[tokio::test]
    async fn test_wrong_run_in_segment_fails_closed() {
        let server = MockServer::start().await;
        let stale = message(
            run() - chrono::Duration::hours(6),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 12, values: uniform(290.0) }],
        );
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(stale))
            .mount(&server)
            .await;

        let err = collector(&server.uri(), vec![Parameter::Temperature])
            .fetch_forecast(&locations(1)[0], run())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Parsing(_)));
    }

    #[tokio::test]
    async fn test_masked_point_is_skipped_and_outside_location_fails() {
        let server = MockServer::start().await;
        let mut masked = uniform(288.0);
        masked[8] = None;
        let body = message(
            run(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 6, values: masked }],
        );
        // the second segment is not mounted and answers 404
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_00H06H.grib2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let inside = Location::new("north", "North", 45.9, 6.1);
        let near_mask = Location::new("south_east", "South east", 45.1, 6.9);
        let outside = Location::new("far", "Far", 48.0, 6.5);

        let batch = collector(&server.uri(), vec![Parameter::Temperature])
            .fetch_forecasts(&[inside, near_mask, outside], run())
            .await;

        assert_eq!(batch.gaps.len(), 1);
        assert_eq!(batch.readings.len(), 1);
        assert!(batch.readings.iter().all(|r| r.location_id == "north"));
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, "far");
    }

    #[tokio::test]
    async fn test_single_location_uses_one_download_per_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_00H06H.grib2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(first_segment()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/20240601/00/SP1_07H12H.grib2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(second_segment()))
            .expect(1)
            .mount(&server)
            .await;

        let readings = collector(&server.uri(), vec![Parameter::WindSpeed])
            .fetch_forecast(&locations(1)[0], run())
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.location_id == "loc0"));
    }

    #[tokio::test]
    async fn test_single_location_outside_grid_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(first_segment()))
            .mount(&server)
            .await;

        let far = Location::new("far", "Far", 48.0, 6.5);
        let err = collector(&server.uri(), vec![Parameter::Temperature])
            .fetch_forecast(&far, run())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }
}
