//! Deviation engine: the only producer of [`Deviation`] values.

use forecast_verify_core::{Deviation, MatchedPair, Parameter, SanityViolation};
use rust_decimal::Decimal;

const FULL_TURN: Decimal = Decimal::from_parts(360, 0, 0, false, 0);
const HALF_TURN: Decimal = Decimal::from_parts(180, 0, 0, false, 0);

/// Signed difference `observed - forecast`.
///
/// For circular parameters the difference is wrapped into `[-180, 180)`.
#[must_use]
pub fn signed_difference(parameter: Parameter, forecast: Decimal, observed: Decimal) -> Decimal {
    let raw = observed - forecast;
    if !parameter.is_circular() {
        return raw;
    }
    let mut wrapped = raw % FULL_TURN;
    if wrapped >= HALF_TURN {
        wrapped -= FULL_TURN;
    } else if wrapped < -HALF_TURN {
        wrapped += FULL_TURN;
    }
    wrapped
}

/// Computes the deviation for a matched pair. `observed_at` carries the
/// time the observation was taken.
///
/// # Errors
/// Returns [`SanityViolation`] if either value lies outside the parameter's
/// plausible envelope (for example 85 °C). No deviation is produced.
pub fn compute(pair: &MatchedPair) -> Result<Deviation, SanityViolation> {
    pair.parameter.check_sane(pair.forecast_value)?;
    pair.parameter.check_sane(pair.observed_value)?;

    Ok(Deviation {
        timestamp: pair.target_time,
        location_id: pair.location_id.clone(),
        model_id: pair.model_id.clone(),
        parameter: pair.parameter,
        horizon: pair.horizon.hours,
        forecast_value: pair.forecast_value,
        observed_value: pair.observed_value,
        deviation: signed_difference(pair.parameter, pair.forecast_value, pair.observed_value),
        run_time: pair.run_time,
        observed_at: pair.observed_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use forecast_verify_core::HorizonBucket;
    use rust_decimal_macros::dec;

    fn pair(parameter: Parameter, forecast: Decimal, observed: Decimal) -> MatchedPair {
        MatchedPair {
            forecast_id: 7,
            location_id: "planfait".into(),
            parameter,
            model_id: "arome".into(),
            run_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            target_time: Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap(),
            observed_time: Utc.with_ymd_and_hms(2024, 6, 1, 6, 5, 0).unwrap(),
            forecast_value: forecast,
            observed_value: observed,
            horizon: HorizonBucket::new(6, 1),
        }
    }

    #[test]
    fn test_scenario_a_deviation() {
        let d = compute(&pair(Parameter::WindSpeed, dec!(25), dec!(18))).unwrap();
        assert_eq!(d.deviation, dec!(-7));
        assert_eq!(d.horizon, 6);
        assert_eq!(d.timestamp, Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap());
        assert_eq!(d.run_time, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_observed_at_is_the_observation_time() {
        let p = pair(Parameter::WindSpeed, dec!(25), dec!(18));
        let d = compute(&p).unwrap();
        assert_eq!(d.observed_at, p.observed_time);
        assert_ne!(d.observed_at, d.timestamp);
    }

    #[test]
    fn test_deviation_is_exact_decimal() {
        let d = compute(&pair(Parameter::Temperature, dec!(0.1), dec!(0.3))).unwrap();
        assert_eq!(d.deviation, dec!(0.2));
        assert_eq!(d.forecast_value + d.deviation, d.observed_value);
    }

    #[test]
    fn test_scenario_c_out_of_envelope() {
        let err = compute(&pair(Parameter::Temperature, dec!(20), dec!(85))).unwrap_err();
        assert_eq!(err.parameter, Parameter::Temperature);
        assert!((err.value - 85.0).abs() < f64::EPSILON);

        assert!(compute(&pair(Parameter::WindSpeed, dec!(-1), dec!(10))).is_err());
    }

    #[test]
    fn test_direction_wraps_across_north() {
        assert_eq!(signed_difference(Parameter::WindDirection, dec!(350), dec!(10)), dec!(20));
        assert_eq!(signed_difference(Parameter::WindDirection, dec!(10), dec!(350)), dec!(-20));
        assert_eq!(signed_difference(Parameter::WindDirection, dec!(0), dec!(180)), dec!(-180));
        assert_eq!(signed_difference(Parameter::WindDirection, dec!(180), dec!(0)), dec!(-180));
        assert_eq!(signed_difference(Parameter::WindDirection, dec!(90), dec!(100.5)), dec!(10.5));
    }

    #[test]
    fn test_wrapped_deviation_stays_in_half_open_range() {
        for forecast in (0..=360).step_by(15) {
            for observed in (0..=360).step_by(15) {
                let d = signed_difference(Parameter::WindDirection, Decimal::from(forecast), Decimal::from(observed));
                assert!(d >= dec!(-180) && d < dec!(180), "{forecast} -> {observed} gave {d}");
                let back = (Decimal::from(forecast) + d - Decimal::from(observed)) % dec!(360);
                assert_eq!(back, Decimal::ZERO);
            }
        }
    }

    #[test]
    fn test_speed_does_not_wrap() {
        assert_eq!(signed_difference(Parameter::WindGust, dec!(10), dec!(250)), dec!(240));
    }
}
