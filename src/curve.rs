// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Temperature range tables and duty interpolation.
//!
//! A range table maps a temperature reading to a dimmer duty value (0-100).
//! Inside a range the duty is linearly interpolated and rounded down; outside
//! the table it saturates to the lowest or highest configured duty.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One segment of a range table.
///
/// Serialized as a `[temp_low, temp_high, duty_low, duty_high]` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64, u8, u8)", into = "(f64, f64, u8, u8)")]
pub struct TemperatureRange {
    /// Inclusive lower temperature bound in degrees Celsius
    pub temp_low: f64,
    /// Exclusive upper temperature bound in degrees Celsius
    pub temp_high: f64,
    /// Duty at `temp_low`
    pub duty_low: u8,
    /// Duty approached as the temperature nears `temp_high`
    pub duty_high: u8,
}

impl TemperatureRange {
    pub const fn new(temp_low: f64, temp_high: f64, duty_low: u8, duty_high: u8) -> Self {
        Self {
            temp_low,
            temp_high,
            duty_low,
            duty_high,
        }
    }

    fn contains(&self, temperature: f64) -> bool {
        self.temp_low <= temperature && temperature < self.temp_high
    }

    fn interpolate(&self, temperature: f64) -> u8 {
        let frac = (temperature - self.temp_low) / (self.temp_high - self.temp_low);
        let span = f64::from(self.duty_high) - f64::from(self.duty_low);
        let duty = f64::from(self.duty_low) + (frac * span).floor();
        duty.clamp(0.0, 100.0) as u8
    }
}

impl From<(f64, f64, u8, u8)> for TemperatureRange {
    fn from((temp_low, temp_high, duty_low, duty_high): (f64, f64, u8, u8)) -> Self {
        Self::new(temp_low, temp_high, duty_low, duty_high)
    }
}

impl From<TemperatureRange> for (f64, f64, u8, u8) {
    fn from(r: TemperatureRange) -> Self {
        (r.temp_low, r.temp_high, r.duty_low, r.duty_high)
    }
}

/// Evaluate a list of ranges for a temperature.
///
/// The first range with `temp_low <= temperature < temp_high` wins. With no
/// matching range the result is the highest `duty_high` at or above the top
/// of the table, and the lowest `duty_low` everywhere else (below the table,
/// inside a gap, or for a NaN reading).
pub fn evaluate(temperature: f64, ranges: &[TemperatureRange]) -> u8 {
    if let Some(range) = ranges.iter().find(|r| r.contains(temperature)) {
        return range.interpolate(temperature);
    }

    let Some(first) = ranges.first() else {
        return 0;
    };

    let max_temp = ranges.iter().map(|r| r.temp_high).fold(first.temp_high, f64::max);
    if temperature >= max_temp {
        return ranges.iter().map(|r| r.duty_high).max().unwrap_or(first.duty_high);
    }

    ranges.iter().map(|r| r.duty_low).min().unwrap_or(first.duty_low)
}

/// An ordered, validated, immutable set of temperature ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RangeInput", into = "Vec<TemperatureRange>")]
pub struct RangeTable {
    ranges: Vec<TemperatureRange>,
}

impl RangeTable {
    /// Build a table, rejecting empty tables, inverted or non-finite bounds,
    /// and duties above 100.
    pub fn new(ranges: Vec<TemperatureRange>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(Error::InvalidRanges("table is empty".to_string()));
        }
        for (i, r) in ranges.iter().enumerate() {
            if !r.temp_low.is_finite() || !r.temp_high.is_finite() {
                return Err(Error::InvalidRanges(format!(
                    "range {i} has a non-finite temperature bound"
                )));
            }
            if r.temp_low >= r.temp_high {
                return Err(Error::InvalidRanges(format!(
                    "range {i}: temp_low {} must be below temp_high {}",
                    r.temp_low, r.temp_high
                )));
            }
            if r.duty_low > 100 || r.duty_high > 100 {
                return Err(Error::InvalidRanges(format!(
                    "range {i}: duty values must be within 0-100"
                )));
            }
        }
        Ok(Self { ranges })
    }

    pub fn ranges(&self) -> &[TemperatureRange] {
        &self.ranges
    }

    /// Duty for the given temperature, always within
    /// `[min_duty(), max_duty()]`.
    pub fn evaluate(&self, temperature: f64) -> u8 {
        evaluate(temperature, &self.ranges)
    }

    pub fn min_duty(&self) -> u8 {
        self.ranges.iter().map(|r| r.duty_low).min().unwrap_or(0)
    }

    pub fn max_duty(&self) -> u8 {
        self.ranges.iter().map(|r| r.duty_high).max().unwrap_or(0)
    }
}

impl Default for RangeTable {
    fn default() -> Self {
        Self {
            ranges: default_ranges(),
        }
    }
}

/// Parse the expression form `[(0, 55, 0, 0), (55, 70, 0, 50)]`.
///
/// Groups may use `()` or `[]`; the outer brackets are optional.
impl FromStr for RangeTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut rest = s.trim();
        if let Some(inner) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            // Only strip when the brackets wrap the whole list, not one group.
            if inner.trim_start().starts_with(['(', '[']) || inner.trim().is_empty() {
                rest = inner.trim();
            }
        }

        let mut ranges = Vec::new();
        while !rest.is_empty() {
            let (close, body) = if let Some(body) = rest.strip_prefix('(') {
                (')', body)
            } else if let Some(body) = rest.strip_prefix('[') {
                (']', body)
            } else {
                return Err(Error::InvalidRanges(format!("expected '(' at '{rest}'")));
            };
            let end = body
                .find(close)
                .ok_or_else(|| Error::InvalidRanges(format!("unclosed group at '{rest}'")))?;

            ranges.push(parse_group(&body[..end])?);

            rest = body[end + 1..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }

        RangeTable::new(ranges)
    }
}

fn parse_group(group: &str) -> Result<TemperatureRange> {
    let fields: Vec<&str> = group.split(',').map(str::trim).collect();
    let [temp_low, temp_high, duty_low, duty_high] = fields.as_slice() else {
        return Err(Error::InvalidRanges(format!(
            "expected 4 values in '({group})', got {}",
            fields.len()
        )));
    };

    let temp = |v: &str| {
        v.parse::<f64>()
            .map_err(|e| Error::InvalidRanges(format!("bad temperature '{v}': {e}")))
    };
    let duty = |v: &str| {
        v.parse::<u8>()
            .map_err(|e| Error::InvalidRanges(format!("bad duty '{v}': {e}")))
    };

    Ok(TemperatureRange::new(
        temp(*temp_low)?,
        temp(*temp_high)?,
        duty(*duty_low)?,
        duty(*duty_high)?,
    ))
}

/// Config-side representation: either the expression string or a TOML array.
#[derive(Deserialize)]
#[serde(untagged)]
enum RangeInput {
    Text(String),
    List(Vec<TemperatureRange>),
}

impl TryFrom<RangeInput> for RangeTable {
    type Error = Error;

    fn try_from(input: RangeInput) -> Result<Self> {
        match input {
            RangeInput::Text(text) => text.parse(),
            RangeInput::List(ranges) => RangeTable::new(ranges),
        }
    }
}

impl From<RangeTable> for Vec<TemperatureRange> {
    fn from(table: RangeTable) -> Self {
        table.ranges
    }
}

/// Quiet until 55C, then a steep ramp up to full duty at 100C.
pub fn default_ranges() -> Vec<TemperatureRange> {
    vec![
        TemperatureRange::new(0.0, 55.0, 0, 0),
        TemperatureRange::new(55.0, 70.0, 0, 50),
        TemperatureRange::new(70.0, 85.0, 50, 65),
        TemperatureRange::new(85.0, 90.0, 65, 75),
        TemperatureRange::new(90.0, 100.0, 75, 100),
    ]
}
