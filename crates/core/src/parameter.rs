//! Weather parameters and unit normalization.
//!
//! Every collector converts its native units into the canonical set at the
//! point of parsing: speed in km/h, temperature in °C, direction in degrees
//! within `[0, 360]`.

use crate::error::{ParsingError, SanityViolation};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Conversion factor from metres per second to kilometres per hour.
const MS_TO_KMH: f64 = 3.6;

/// Conversion factor from knots to kilometres per hour.
const KNOT_TO_KMH: f64 = 1.852;

/// Conversion factor from miles per hour to kilometres per hour.
const MPH_TO_KMH: f64 = 1.609_344;

/// A measured or predicted quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// Mean wind speed at 10 m
    WindSpeed,
    /// Wind gust at 10 m
    WindGust,
    /// Direction the wind blows from, meteorological convention
    WindDirection,
    /// Air temperature at 2 m
    Temperature,
}

impl Parameter {
    /// Returns every supported parameter.
    #[must_use]
    pub fn all() -> [Parameter; 4] {
        [
            Parameter::WindSpeed,
            Parameter::WindGust,
            Parameter::WindDirection,
            Parameter::Temperature,
        ]
    }

    /// Stable identifier used in storage and configuration.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Parameter::WindSpeed => "wind_speed",
            Parameter::WindGust => "wind_gust",
            Parameter::WindDirection => "wind_direction",
            Parameter::Temperature => "temperature",
        }
    }

    /// Canonical unit of the parameter.
    #[must_use]
    pub fn canonical_unit(&self) -> Unit {
        match self {
            Parameter::WindSpeed | Parameter::WindGust => Unit::KilometresPerHour,
            Parameter::WindDirection => Unit::Degrees,
            Parameter::Temperature => Unit::Celsius,
        }
    }

    /// Number of decimal places values are kept at.
    #[must_use]
    pub fn precision(&self) -> u32 {
        1
    }

    /// True when values live on a circle (deviation wraps at 360).
    #[must_use]
    pub fn is_circular(&self) -> bool {
        matches!(self, Parameter::WindDirection)
    }

    /// Plausible envelope for a canonical-unit value.
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        match self {
            Parameter::WindSpeed => Envelope::new(0.0, 250.0),
            Parameter::WindGust => Envelope::new(0.0, 350.0),
            Parameter::WindDirection => Envelope::new(0.0, 360.0),
            Parameter::Temperature => Envelope::new(-60.0, 60.0),
        }
    }

    /// Checks a canonical value against the parameter's envelope.
    ///
    /// # Errors
    /// Returns [`SanityViolation`] if the value is outside the envelope.
    pub fn check_sane(&self, value: Decimal) -> Result<(), SanityViolation> {
        let envelope = self.envelope();
        let as_float = value.to_f64().unwrap_or(f64::NAN);
        if envelope.contains(as_float) {
            Ok(())
        } else {
            Err(SanityViolation {
                parameter: *self,
                value: as_float,
                min: envelope.min,
                max: envelope.max,
            })
        }
    }

    /// Converts a raw source value into the canonical unit, rounded to the
    /// parameter precision.
    ///
    /// Direction values are folded into `[0, 360)`.
    ///
    /// # Errors
    /// Returns [`ParsingError`] if the value is not finite or the unit does not
    /// measure this parameter.
    pub fn normalize(&self, source_id: &str, value: f64, unit: Unit) -> Result<Decimal, ParsingError> {
        if !value.is_finite() {
            return Err(ParsingError::new(
                source_id,
                format!("non-finite {} value", self.id()),
            ));
        }

        let canonical = match (self, unit) {
            (Parameter::WindSpeed | Parameter::WindGust, Unit::KilometresPerHour) => value,
            (Parameter::WindSpeed | Parameter::WindGust, Unit::MetresPerSecond) => value * MS_TO_KMH,
            (Parameter::WindSpeed | Parameter::WindGust, Unit::Knots) => value * KNOT_TO_KMH,
            (Parameter::WindSpeed | Parameter::WindGust, Unit::MilesPerHour) => value * MPH_TO_KMH,
            (Parameter::Temperature, Unit::Celsius) => value,
            (Parameter::Temperature, Unit::Fahrenheit) => (value - 32.0) * 5.0 / 9.0,
            (Parameter::Temperature, Unit::Kelvin) => value - 273.15,
            (Parameter::WindDirection, Unit::Degrees) => {
                if value == 360.0 {
                    value
                } else {
                    value.rem_euclid(360.0)
                }
            }
            (parameter, unit) => {
                return Err(ParsingError::new(
                    source_id,
                    format!("unit {unit} cannot express {}", parameter.id()),
                ))
            }
        };

        Decimal::from_f64(canonical)
            .map(|d| d.round_dp(self.precision()))
            .ok_or_else(|| ParsingError::new(source_id, format!("unrepresentable value {canonical}")))
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Parameter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "wind_speed" => Ok(Parameter::WindSpeed),
            "wind_gust" => Ok(Parameter::WindGust),
            "wind_direction" => Ok(Parameter::WindDirection),
            "temperature" => Ok(Parameter::Temperature),
            _ => Err(anyhow::anyhow!(
                "Invalid parameter: '{}'. Valid values: wind_speed, wind_gust, wind_direction, temperature",
                s
            )),
        }
    }
}

/// Closed interval of plausible values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min: f64,
    pub max: f64,
}

impl Envelope {
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Units as reported by upstream sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    KilometresPerHour,
    MetresPerSecond,
    Knots,
    MilesPerHour,
    Celsius,
    Fahrenheit,
    Kelvin,
    Degrees,
}

impl Unit {
    /// Parses a unit label as written by an upstream payload.
    ///
    /// Unknown labels fail closed rather than guessing.
    ///
    /// # Errors
    /// Returns [`ParsingError`] for unrecognized labels.
    pub fn from_label(source_id: &str, label: &str) -> Result<Unit, ParsingError> {
        let normalized = label.trim().to_lowercase();
        let unit = match normalized.as_str() {
            "km/h" | "kmh" | "kph" | "km/hr" => Unit::KilometresPerHour,
            "m/s" | "ms" | "m s-1" | "m/sec" => Unit::MetresPerSecond,
            "kn" | "kt" | "kts" | "knots" => Unit::Knots,
            "mph" | "mp/h" => Unit::MilesPerHour,
            "°c" | "c" | "celsius" | "degc" => Unit::Celsius,
            "°f" | "f" | "fahrenheit" | "degf" => Unit::Fahrenheit,
            "k" | "kelvin" => Unit::Kelvin,
            "°" | "deg" | "degree" | "degrees" => Unit::Degrees,
            _ => {
                return Err(ParsingError::new(
                    source_id,
                    format!("unrecognized unit label '{label}'"),
                ))
            }
        };
        Ok(unit)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Unit::KilometresPerHour => "km/h",
            Unit::MetresPerSecond => "m/s",
            Unit::Knots => "kn",
            Unit::MilesPerHour => "mph",
            Unit::Celsius => "°C",
            Unit::Fahrenheit => "°F",
            Unit::Kelvin => "K",
            Unit::Degrees => "°",
        };
        f.write_str(label)
    }
}
