//! Observation collector for a station's tabular HTML page.
//!
//! Columns are located by their header labels, never by position. Headers
//! carry their unit in parentheses, e.g. `Wind (km/h)`; a speed or temperature
//! column without a recognizable unit is ambiguous and fails the page.

use crate::resilience::ResilientClient;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use forecast_verify_core::{
    CollectError, ConfigurationError, Location, ObservationCollector, Parameter, ParsingError,
    RawReading, TimeWindow, Unit,
};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

pub const SOURCE_ID: &str = "station_page";

/// Cell contents that mean "no measurement".
const MISSING_MARKERS: [&str; 5] = ["", "-", "--", "n/a", "null"];

fn row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<tr(?:\s[^>]*)?>(.*?)</tr>").expect("valid regex"))
}

fn cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<t([hd])(?:\s[^>]*)?>(.*?)</t[hd]>").expect("valid regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"))
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]+)\)").expect("valid regex"))
}

fn cell_text(html: &str) -> String {
    tag_re()
        .replace_all(html, "")
        .replace("&nbsp;", " ")
        .replace("&deg;", "°")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Time,
    Measure(Parameter),
}

/// Classifies a header label. Order matters: "max wind" is a gust column.
fn classify_header(label: &str) -> Option<Column> {
    let lower = label.to_lowercase();
    if lower.starts_with("time") || lower.starts_with("date") || lower.starts_with("heure") {
        Some(Column::Time)
    } else if lower.contains("gust") || lower.contains("rafale") || lower.contains("max") {
        Some(Column::Measure(Parameter::WindGust))
    } else if lower.contains("dir") || lower.contains("heading") {
        Some(Column::Measure(Parameter::WindDirection))
    } else if lower.contains("temp") {
        Some(Column::Measure(Parameter::Temperature))
    } else if lower.contains("wind") || lower.contains("vent") || lower.contains("speed") {
        Some(Column::Measure(Parameter::WindSpeed))
    } else {
        None
    }
}

fn parse_time(source_id: &str, s: &str) -> Result<DateTime<Utc>, ParsingError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let trimmed = s.trim_end_matches("UTC").trim();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S"))
        .map(|t| t.and_utc())
        .map_err(|_| ParsingError::new(source_id, format!("unrecognized time cell '{s}'")))
}

/// Index of the one header classified as `column`. Two candidates make the
/// page ambiguous.
fn single_column(
    source_id: &str,
    labels: &[(Option<Column>, String)],
    column: Column,
) -> Result<Option<usize>, ParsingError> {
    let mut matches = labels
        .iter()
        .enumerate()
        .filter(|(_, (c, _))| *c == Some(column))
        .map(|(idx, _)| idx);
    let first = matches.next();
    if let (Some(a), Some(b)) = (first, matches.next()) {
        return Err(ParsingError::new(
            source_id,
            format!("ambiguous header: '{}' and '{}' both match", labels[a].1, labels[b].1),
        ));
    }
    Ok(first)
}

/// Extracts observations from a station page.
///
/// # Errors
/// Returns [`ParsingError`] if no header row is found, a required column is
/// missing or matched by two headers, a header unit is ambiguous, or a
/// non-missing cell is not numeric.
pub fn parse_station_page(
    source_id: &str,
    html: &str,
    location_id: &str,
    parameters: &[Parameter],
    window: TimeWindow,
) -> Result<Vec<RawReading>, ParsingError> {
    let mut header: Option<Vec<(Option<Column>, String)>> = None;
    let mut readings = Vec::new();
    let mut layout: Vec<(Parameter, usize, Unit)> = Vec::new();
    let mut time_idx = 0;

    for row in row_re().captures_iter(html) {
        let cells: Vec<(bool, String)> = cell_re()
            .captures_iter(&row[1])
            .map(|c| (&c[1] == "h" || &c[1] == "H", cell_text(&c[2])))
            .collect();
        if cells.is_empty() {
            continue;
        }

        if header.is_none() {
            if !cells.iter().all(|(is_header, _)| *is_header) {
                continue;
            }
            let labels: Vec<(Option<Column>, String)> = cells
                .iter()
                .map(|(_, text)| (classify_header(text), text.clone()))
                .collect();

            time_idx = single_column(source_id, &labels, Column::Time)?
                .ok_or_else(|| ParsingError::new(source_id, "no time column in header"))?;

            for &parameter in parameters {
                let Some(idx) = single_column(source_id, &labels, Column::Measure(parameter))? else {
                    return Err(ParsingError::new(
                        source_id,
                        format!("no {} column in header", parameter.id()),
                    ));
                };
                let unit = match unit_re().captures(&labels[idx].1) {
                    Some(c) => Unit::from_label(source_id, &c[1])?,
                    None if parameter == Parameter::WindDirection => Unit::Degrees,
                    None => {
                        return Err(ParsingError::new(
                            source_id,
                            format!("header '{}' has no unit", labels[idx].1),
                        ))
                    }
                };
                layout.push((parameter, idx, unit));
            }
            header = Some(labels);
            continue;
        }

        let width = header.as_ref().map_or(0, Vec::len);
        if cells.len() != width {
            return Err(ParsingError::new(
                source_id,
                format!("row has {} cells, header has {width}", cells.len()),
            ));
        }

        let observed_time = parse_time(source_id, &cells[time_idx].1)?;
        if !window.contains(observed_time) {
            continue;
        }

        for &(parameter, idx, unit) in &layout {
            let text = cells[idx].1.as_str();
            if MISSING_MARKERS.contains(&text.to_lowercase().as_str()) {
                continue;
            }
            let raw: f64 = text
                .replace(',', ".")
                .parse()
                .map_err(|_| ParsingError::new(source_id, format!("non-numeric {} cell '{text}'", parameter.id())))?;
            readings.push(RawReading::observation(
                location_id,
                parameter,
                parameter.normalize(source_id, raw, unit)?,
                source_id,
                observed_time,
            ));
        }
    }

    if header.is_none() {
        return Err(ParsingError::new(source_id, "no observation table found"));
    }
    Ok(readings)
}

pub struct StationPageCollector {
    client: ResilientClient,
    url_template: String,
    parameters: Vec<Parameter>,
    source_id: String,
}

impl StationPageCollector {
    /// `url_template` contains `{station}`, replaced by the location's station id.
    #[must_use]
    pub fn new(client: ResilientClient, url_template: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            source_id: client.source_id().to_string(),
            client,
            url_template: url_template.into(),
            parameters,
        }
    }
}

#[async_trait]
impl ObservationCollector for StationPageCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_observation(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<RawReading>, CollectError> {
        let station = location.station_for(&self.source_id).ok_or_else(|| {
            ConfigurationError::new(format!(
                "location {} has no {} station",
                location.id, self.source_id
            ))
        })?;
        let url = self.url_template.replace("{station}", station);

        let html = self.client.get_text(&url, &[]).await?;
        let readings = parse_station_page(&self.source_id, &html, &location.id, &self.parameters, window)?;

        debug!(
            source = %self.source_id,
            station,
            location = %location.id,
            readings = readings.len(),
            "Parsed station page"
        );
        Ok(readings)
    }
}
