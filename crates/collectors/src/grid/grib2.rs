//! GRIB edition 2 decoder for regular latitude/longitude simple-packed fields.
//!
//! Supported: grid definition template 3.0, product definition templates
//! 4.0, 4.1 and 4.8, data representation template 5.0 and bitmaps (section 6
//! indicators 0, 254, 255). Messages may carry several fields; sections 3 to 7
//! repeat within one message. Anything else is rejected with a
//! [`ParsingError`] rather than decoded approximately.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use forecast_verify_core::ParsingError;

/// Byte offsets below are 0-based from the start of each section.
const SECTION0_LEN: usize = 16;
const END_MARKER: &[u8; 4] = b"7777";

/// Regular latitude/longitude grid (template 3.0).
#[derive(Debug, Clone, PartialEq)]
pub struct LatLonGrid {
    pub ni: usize,
    pub nj: usize,
    /// Latitude of the first grid point (degrees)
    pub la1: f64,
    /// Longitude of the first grid point (degrees)
    pub lo1: f64,
    pub la2: f64,
    pub lo2: f64,
    /// i-direction increment (degrees)
    pub di: f64,
    /// j-direction increment (degrees)
    pub dj: f64,
    pub scan_mode: u8,
}

impl LatLonGrid {
    /// True when rows run south to north (scan mode bit 0x40).
    #[must_use]
    pub fn south_to_north(&self) -> bool {
        self.scan_mode & 0x40 != 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ni * self.nj
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded field.
#[derive(Debug, Clone, PartialEq)]
pub struct Grib2Field {
    pub discipline: u8,
    pub category: u8,
    pub number: u8,
    pub reference_time: DateTime<Utc>,
    /// Validity time of the values
    pub valid_time: DateTime<Utc>,
    /// Type of first fixed surface (103 = height above ground)
    pub surface_type: u8,
    pub surface_value: f64,
    pub grid: LatLonGrid,
    /// Row-major values in scan order; `None` where the bitmap masks a point
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy)]
struct Packing {
    points: usize,
    reference: f32,
    binary_scale: i32,
    decimal_scale: i32,
    bits: u8,
}

#[derive(Debug, Clone, Copy)]
struct Product {
    category: u8,
    number: u8,
    valid_offset: Duration,
    surface_type: u8,
    surface_value: f64,
}

struct Reader<'a> {
    source_id: &'a str,
}

impl Reader<'_> {
    fn err(&self, message: impl Into<String>) -> ParsingError {
        ParsingError::new(self.source_id, message)
    }

    fn slice<'b>(&self, bytes: &'b [u8], start: usize, len: usize) -> Result<&'b [u8], ParsingError> {
        start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
            .ok_or_else(|| self.err(format!("GRIB2 section truncated at byte {start}")))
    }

    fn u8_at(&self, bytes: &[u8], at: usize) -> Result<u8, ParsingError> {
        Ok(self.slice(bytes, at, 1)?[0])
    }

    fn u16_at(&self, bytes: &[u8], at: usize) -> Result<u16, ParsingError> {
        let b = self.slice(bytes, at, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_at(&self, bytes: &[u8], at: usize) -> Result<u32, ParsingError> {
        let b = self.slice(bytes, at, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Sign-magnitude 16-bit integer.
    fn i16_at(&self, bytes: &[u8], at: usize) -> Result<i32, ParsingError> {
        let raw = self.u16_at(bytes, at)?;
        let magnitude = i32::from(raw & 0x7fff);
        Ok(if raw & 0x8000 != 0 { -magnitude } else { magnitude })
    }

    /// Sign-magnitude 32-bit integer.
    fn i32_at(&self, bytes: &[u8], at: usize) -> Result<i64, ParsingError> {
        let raw = self.u32_at(bytes, at)?;
        let magnitude = i64::from(raw & 0x7fff_ffff);
        Ok(if raw & 0x8000_0000 != 0 { -magnitude } else { magnitude })
    }
}

/// Decodes every field of every message in `bytes`.
///
/// # Errors
/// Returns [`ParsingError`] for truncated data, unsupported templates or
/// inconsistent point counts.
pub fn decode_messages(source_id: &str, bytes: &[u8]) -> Result<Vec<Grib2Field>, ParsingError> {
    let r = Reader { source_id };
    let mut fields = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        // tolerate padding between messages
        let Some(pos) = find_marker(&bytes[offset..]) else {
            break;
        };
        offset += pos;
        let header = r.slice(bytes, offset, SECTION0_LEN)?;
        let edition = header[7];
        if edition != 2 {
            return Err(r.err(format!("unsupported GRIB edition {edition}")));
        }
        let discipline = header[6];
        let total = u64::from_be_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14], header[15],
        ]);
        let total = usize::try_from(total).map_err(|_| r.err("GRIB2 message length overflows"))?;
        let message = r.slice(bytes, offset, total)?;
        decode_message(&r, discipline, message, &mut fields)?;
        offset += total;
    }

    if fields.is_empty() {
        return Err(r.err("no GRIB2 fields found"));
    }
    Ok(fields)
}

fn find_marker(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"GRIB")
}

fn decode_message(
    r: &Reader<'_>,
    discipline: u8,
    message: &[u8],
    fields: &mut Vec<Grib2Field>,
) -> Result<(), ParsingError> {
    let mut at = SECTION0_LEN;
    let mut reference_time = None;
    let mut grid: Option<LatLonGrid> = None;
    let mut product: Option<Product> = None;
    let mut packing: Option<Packing> = None;
    let mut bitmap: Option<Vec<bool>> = None;
    let mut previous_bitmap: Option<Vec<bool>> = None;

    loop {
        if r.slice(message, at, 4)? == END_MARKER {
            return Ok(());
        }
        let len = r.u32_at(message, at)? as usize;
        if len < 5 {
            return Err(r.err(format!("GRIB2 section at byte {at} has length {len}")));
        }
        let section = r.slice(message, at, len)?;
        let number = section[4];

        match number {
            1 => reference_time = Some(decode_reference_time(r, section)?),
            2 => {}
            3 => grid = Some(decode_grid(r, section)?),
            4 => {
                let reference = reference_time.ok_or_else(|| r.err("section 4 before section 1"))?;
                product = Some(decode_product(r, section, reference)?);
            }
            5 => packing = Some(decode_packing(r, section)?),
            6 => {
                let indicator = r.u8_at(section, 5)?;
                bitmap = match indicator {
                    255 => None,
                    0 => {
                        let g = grid.as_ref().ok_or_else(|| r.err("bitmap before grid definition"))?;
                        let bits = expand_bitmap(r, &section[6..], g.len())?;
                        previous_bitmap = Some(bits.clone());
                        Some(bits)
                    }
                    254 => Some(
                        previous_bitmap
                            .clone()
                            .ok_or_else(|| r.err("bitmap indicator 254 without a previous bitmap"))?,
                    ),
                    other => return Err(r.err(format!("unsupported bitmap indicator {other}"))),
                };
            }
            7 => {
                let g = grid.clone().ok_or_else(|| r.err("data section before grid definition"))?;
                let p = product.ok_or_else(|| r.err("data section before product definition"))?;
                let k = packing.ok_or_else(|| r.err("data section before data representation"))?;
                let reference = reference_time.ok_or_else(|| r.err("data section before section 1"))?;
                let valid_time = reference
                    .checked_add_signed(p.valid_offset)
                    .ok_or_else(|| r.err(format!("forecast offset {} is out of range", p.valid_offset)))?;
                let values = unpack(r, &section[5..], &g, &k, bitmap.as_deref())?;
                fields.push(Grib2Field {
                    discipline,
                    category: p.category,
                    number: p.number,
                    reference_time: reference,
                    valid_time,
                    surface_type: p.surface_type,
                    surface_value: p.surface_value,
                    grid: g,
                    values,
                });
            }
            other => return Err(r.err(format!("unexpected GRIB2 section {other}"))),
        }
        at += len;
    }
}

fn decode_reference_time(r: &Reader<'_>, s: &[u8]) -> Result<DateTime<Utc>, ParsingError> {
    let year = i32::from(r.u16_at(s, 12)?);
    let (month, day) = (r.u8_at(s, 14)?, r.u8_at(s, 15)?);
    let (hour, minute, second) = (r.u8_at(s, 16)?, r.u8_at(s, 17)?, r.u8_at(s, 18)?);
    Utc.with_ymd_and_hms(
        year,
        u32::from(month),
        u32::from(day),
        u32::from(hour),
        u32::from(minute),
        u32::from(second),
    )
    .single()
    .ok_or_else(|| r.err(format!("invalid reference time {year}-{month}-{day} {hour}:{minute}")))
}

fn decode_grid(r: &Reader<'_>, s: &[u8]) -> Result<LatLonGrid, ParsingError> {
    let template = r.u16_at(s, 12)?;
    if template != 0 {
        return Err(r.err(format!("unsupported grid definition template 3.{template}")));
    }

    let ni = r.u32_at(s, 30)? as usize;
    let nj = r.u32_at(s, 34)? as usize;
    let basic_angle = r.u32_at(s, 38)?;
    let subdivisions = r.u32_at(s, 42)?;
    let unit = if basic_angle == 0 || basic_angle == u32::MAX {
        1e-6
    } else {
        if subdivisions == 0 || subdivisions == u32::MAX {
            return Err(r.err("grid basic angle without subdivisions"));
        }
        f64::from(basic_angle) / f64::from(subdivisions)
    };

    let scan_mode = r.u8_at(s, 71)?;
    if scan_mode & !0x40 != 0 {
        return Err(r.err(format!("unsupported scanning mode {scan_mode:#04x}")));
    }
    if ni < 2 || nj < 2 {
        return Err(r.err(format!("grid {ni}x{nj} is too small to interpolate")));
    }
    if ni.checked_mul(nj).is_none() {
        return Err(r.err(format!("grid {ni}x{nj} is too large")));
    }

    Ok(LatLonGrid {
        ni,
        nj,
        la1: r.i32_at(s, 46)? as f64 * unit,
        lo1: r.i32_at(s, 50)? as f64 * unit,
        la2: r.i32_at(s, 55)? as f64 * unit,
        lo2: r.i32_at(s, 59)? as f64 * unit,
        di: f64::from(r.u32_at(s, 63)?) * unit,
        dj: f64::from(r.u32_at(s, 67)?) * unit,
        scan_mode,
    })
}

fn time_unit(r: &Reader<'_>, code: u8, amount: i64) -> Result<Duration, ParsingError> {
    let duration = match code {
        0 => Duration::try_minutes(amount),
        1 => Duration::try_hours(amount),
        2 => Duration::try_days(amount),
        10 => amount.checked_mul(3).and_then(Duration::try_hours),
        11 => amount.checked_mul(6).and_then(Duration::try_hours),
        12 => amount.checked_mul(12).and_then(Duration::try_hours),
        13 => Duration::try_seconds(amount),
        other => return Err(r.err(format!("unsupported time range unit {other}"))),
    };
    duration.ok_or_else(|| r.err(format!("forecast time {amount} (unit {code}) is out of range")))
}

fn decode_product(r: &Reader<'_>, s: &[u8], reference: DateTime<Utc>) -> Result<Product, ParsingError> {
    let template = r.u16_at(s, 7)?;
    let category = r.u8_at(s, 9)?;
    let number = r.u8_at(s, 10)?;
    let surface_type = r.u8_at(s, 22)?;
    let scale = r.u8_at(s, 23)?;
    let scale = if scale & 0x80 != 0 { -i32::from(scale & 0x7f) } else { i32::from(scale) };
    let scaled = r.i32_at(s, 24)?;
    let surface_value = scaled as f64 / 10f64.powi(scale);

    let valid_offset = match template {
        0 | 1 => {
            let unit = r.u8_at(s, 17)?;
            let amount = i64::from(r.u32_at(s, 18)?);
            time_unit(r, unit, amount)?
        }
        // Statistically processed: values are valid at the end of the interval
        8 => {
            let year = i32::from(r.u16_at(s, 34)?);
            let end = NaiveDate::from_ymd_opt(year, u32::from(r.u8_at(s, 36)?), u32::from(r.u8_at(s, 37)?))
                .and_then(|d| {
                    d.and_hms_opt(
                        u32::from(r.u8_at(s, 38).ok()?),
                        u32::from(r.u8_at(s, 39).ok()?),
                        u32::from(r.u8_at(s, 40).ok()?),
                    )
                })
                .ok_or_else(|| r.err("invalid end of statistical interval"))?
                .and_utc();
            end.signed_duration_since(reference)
        }
        other => return Err(r.err(format!("unsupported product definition template 4.{other}"))),
    };

    Ok(Product {
        category,
        number,
        valid_offset,
        surface_type,
        surface_value,
    })
}

fn decode_packing(r: &Reader<'_>, s: &[u8]) -> Result<Packing, ParsingError> {
    let template = r.u16_at(s, 9)?;
    if template != 0 {
        return Err(r.err(format!("unsupported data representation template 5.{template}")));
    }
    let ref_bytes = r.slice(s, 11, 4)?;
    Ok(Packing {
        points: r.u32_at(s, 5)? as usize,
        reference: f32::from_be_bytes([ref_bytes[0], ref_bytes[1], ref_bytes[2], ref_bytes[3]]),
        binary_scale: r.i16_at(s, 15)?,
        decimal_scale: r.i16_at(s, 17)?,
        bits: r.u8_at(s, 19)?,
    })
}

fn expand_bitmap(r: &Reader<'_>, bytes: &[u8], points: usize) -> Result<Vec<bool>, ParsingError> {
    if bytes.len().saturating_mul(8) < points {
        return Err(r.err(format!("bitmap covers {} points, grid has {points}", bytes.len() * 8)));
    }
    Ok((0..points).map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0).collect())
}

fn unpack(
    r: &Reader<'_>,
    data: &[u8],
    grid: &LatLonGrid,
    packing: &Packing,
    bitmap: Option<&[bool]>,
) -> Result<Vec<Option<f64>>, ParsingError> {
    let expected = bitmap.map_or(grid.len(), |b| b.iter().filter(|set| **set).count());
    if packing.points != expected {
        return Err(r.err(format!(
            "data representation declares {} values, grid and bitmap expect {expected}",
            packing.points
        )));
    }
    let bits = usize::from(packing.bits);
    if bits > 32 {
        return Err(r.err(format!("{bits} bits per value is not supported")));
    }
    let needed = bits.checked_mul(packing.points).ok_or_else(|| r.err("declared packing is too large"))?;
    if data.len().saturating_mul(8) < needed {
        return Err(r.err("data section shorter than declared packing"));
    }

    let reference = f64::from(packing.reference);
    let binary = 2f64.powi(packing.binary_scale);
    let decimal = 10f64.powi(packing.decimal_scale);
    let mut bit_pos = 0;
    let mut next_value = || {
        let mut x: u64 = 0;
        for _ in 0..bits {
            let bit = (data[bit_pos / 8] >> (7 - bit_pos % 8)) & 1;
            x = (x << 1) | u64::from(bit);
            bit_pos += 1;
        }
        (reference + x as f64 * binary) / decimal
    };

    let values = match bitmap {
        None => (0..grid.len()).map(|_| Some(next_value())).collect(),
        Some(mask) => mask.iter().map(|present| present.then(&mut next_value)).collect(),
    };
    Ok(values)
}


#[cfg(test)]
mod tests {
    use super::encode::{message, FieldSpec};
    use super::*;

    fn grid() -> LatLonGrid {
        LatLonGrid {
            ni: 3,
            nj: 2,
            la1: 46.0,
            lo1: 6.0,
            la2: 45.5,
            lo2: 7.0,
            di: 0.5,
            dj: 0.5,
            scan_mode: 0,
        }
    }

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_decode_round_trip_of_one_field() {
        let values = vec![Some(1.0), Some(2.5), Some(3.0), Some(4.0), Some(5.5), Some(6.0)];
        let bytes = message(
            reference(),
            &grid(),
            &[FieldSpec { category: 2, number: 2, forecast_hours: 6, values: values.clone() }],
        );

        let fields = decode_messages("grid", &bytes).unwrap();
        assert_eq!(fields.len(), 1);
        let f = &fields[0];
        assert_eq!((f.discipline, f.category, f.number), (0, 2, 2));
        assert_eq!(f.reference_time, reference());
        assert_eq!(f.valid_time, reference() + Duration::hours(6));
        assert_eq!(f.surface_type, 103);
        assert!((f.surface_value - 10.0).abs() < 1e-9);
        assert_eq!(f.grid.ni, 3);
        assert!((f.grid.la1 - 46.0).abs() < 1e-9);
        assert!((f.grid.di - 0.5).abs() < 1e-9);
        for (decoded, expected) in f.values.iter().zip(values) {
            assert!((decoded.unwrap() - expected.unwrap()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_bitmap_masks_points() {
        let values = vec![Some(280.0), None, Some(281.5), Some(282.0), Some(283.0), None];
        let bytes = message(
            reference(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 12, values }],
        );
        let fields = decode_messages("grid", &bytes).unwrap();
        assert!(fields[0].values[1].is_none());
        assert!(fields[0].values[5].is_none());
        assert!((fields[0].values[2].unwrap() - 281.5).abs() < 1e-6);
    }

    #[test]
    fn test_several_fields_and_messages() {
        let values = vec![Some(1.0); 6];
        let mut bytes = message(
            reference(),
            &grid(),
            &[
                FieldSpec { category: 2, number: 2, forecast_hours: 6, values: values.clone() },
                FieldSpec { category: 2, number: 3, forecast_hours: 6, values: values.clone() },
            ],
        );
        bytes.extend(message(
            reference(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 7, values }],
        ));

        let fields = decode_messages("grid", &bytes).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2].valid_time, reference() + Duration::hours(7));
    }

    #[test]
    fn test_negative_longitude_is_sign_magnitude() {
        let mut g = grid();
        g.lo1 = -5.0;
        g.lo2 = -4.0;
        let bytes = message(
            reference(),
            &g,
            &[FieldSpec { category: 0, number: 0, forecast_hours: 1, values: vec![Some(1.0); 6] }],
        );
        let fields = decode_messages("grid", &bytes).unwrap();
        assert!((fields[0].grid.lo1 + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_other_editions_and_garbage() {
        let mut bytes = message(
            reference(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 1, values: vec![Some(1.0); 6] }],
        );
        bytes[7] = 1;
        assert!(decode_messages("grid", &bytes).unwrap_err().message.contains("edition"));
        assert!(decode_messages("grid", b"<html>not found</html>").is_err());
    }

    #[test]
    fn test_rejects_truncated_message() {
        let bytes = message(
            reference(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 1, values: vec![Some(1.0); 6] }],
        );
        assert!(decode_messages("grid", &bytes[..bytes.len() - 10]).is_err());
    }

    /// Byte offset of the first section numbered `number`.
    fn section_offset(bytes: &[u8], number: u8) -> usize {
        let mut at = 16;
        loop {
            let len = u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
            if bytes[at + 4] == number {
                return at;
            }
            at += len;
        }
    }

    fn one_field(forecast_hours: u32) -> Vec<u8> {
        message(
            reference(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours, values: vec![Some(1.0); 6] }],
        )
    }

    #[test]
    fn test_bitmap_section_without_indicator_is_an_error() {
        let mut bytes = one_field(1);
        let s6 = section_offset(&bytes, 6);
        bytes[s6..s6 + 4].copy_from_slice(&5u32.to_be_bytes());
        let err = decode_messages("grid", &bytes).unwrap_err();
        assert!(err.message.contains("truncated"), "{}", err.message);
    }

    #[test]
    fn test_huge_forecast_offset_is_an_error() {
        let err = decode_messages("grid", &one_field(u32::MAX)).unwrap_err();
        assert!(err.message.contains("out of range"), "{}", err.message);
    }

    #[test]
    fn test_section_length_past_message_end_is_an_error() {
        let mut bytes = one_field(1);
        let s5 = section_offset(&bytes, 5);
        bytes[s5..s5 + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_messages("grid", &bytes).is_err());
    }

    #[test]
    fn test_short_sections_never_panic() {
        let bytes = one_field(6);
        for number in [1, 3, 4, 5, 6, 7] {
            let at = section_offset(&bytes, number);
            for len in 0..12u32 {
                let mut broken = bytes.clone();
                broken[at..at + 4].copy_from_slice(&len.to_be_bytes());
                let result = decode_messages("grid", &broken);
                // a 6-byte bitmap section is the real one; section 7 may just lose values
                if number < 6 {
                    assert!(result.is_err(), "section {number} with length {len} decoded");
                }
            }
        }
    }

    #[test]
    fn test_oversized_grid_is_an_error() {
        let mut bytes = one_field(1);
        let s3 = section_offset(&bytes, 3);
        bytes[s3 + 30..s3 + 34].copy_from_slice(&u32::MAX.to_be_bytes());
        bytes[s3 + 34..s3 + 38].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_messages("grid", &bytes).is_err());
    }

    #[test]
    fn test_rejects_unsupported_grid_template() {
        let mut bytes = message(
            reference(),
            &grid(),
            &[FieldSpec { category: 0, number: 0, forecast_hours: 1, values: vec![Some(1.0); 6] }],
        );
        // section 3 follows section 0 (16 bytes) and section 1 (21 bytes)
        let s3 = 16 + 21;
        assert_eq!(bytes[s3 + 4], 3);
        bytes[s3 + 13] = 30;
        let err = decode_messages("grid", &bytes).unwrap_err();
        assert!(err.message.contains("3.30"));
    }
}
