// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Temperature sensor readout.
//!
//! The controller consumes readings through [`SensorSource`]. On Linux the
//! readings come from `/sys/class/hwmon/`, labelled `"<chip> <label>"`
//! (for example `"k10temp Tctl"` or `"amdgpu edge"`), so the CPU and GPU
//! filters can match on either the driver name or the sensor label.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Current readings keyed by sensor label, in degrees Celsius.
pub type Readings = HashMap<String, f64>;

/// Something that can report current temperatures.
///
/// An empty map means "no reading this tick", never an error.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read(&self) -> Readings;
}

/// Highest CPU and GPU temperature in a set of readings.
///
/// A label counts toward a group when it contains any of that group's
/// filters. Readings are truncated to whole degrees; an empty group is 0.
pub fn split_temperatures(
    readings: &Readings,
    cpu_filters: &[String],
    gpu_filters: &[String],
) -> (f64, f64) {
    let max_of = |filters: &[String]| {
        readings
            .iter()
            .filter(|(label, _)| filters.iter().any(|f| label.contains(f.as_str())))
            .map(|(_, value)| value.trunc())
            .filter(|value| value.is_finite())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .unwrap_or(0.0)
    };
    (max_of(cpu_filters), max_of(gpu_filters))
}

// ---------------------------------------------------------------------------
// hwmon
// ---------------------------------------------------------------------------

/// A discovered hwmon temperature input.
#[derive(Debug, Clone)]
pub struct TempSensor {
    /// Label used as the reading key, e.g. "coretemp Package id 0"
    pub label: String,
    /// Absolute path to the `tempN_input` file (millidegrees C)
    pub input_path: PathBuf,
}

/// Sensor source backed by the hwmon sysfs tree.
///
/// Sensors are rediscovered on every read so drivers loaded after startup
/// (e.g. a GPU coming out of runtime suspend) are picked up.
#[derive(Debug, Clone)]
pub struct HwmonSensors {
    root: PathBuf,
}

impl Default for HwmonSensors {
    fn default() -> Self {
        Self::with_root(HWMON_ROOT)
    }
}

impl HwmonSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scan the hwmon root and return all temperature inputs.
    pub fn discover(&self) -> io::Result<Vec<TempSensor>> {
        let mut sensors = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let hwmon_dir = entry.path();
            let hwmon_name = read_trimmed(&hwmon_dir.join("name"))
                .unwrap_or_else(|| entry.file_name().to_string_lossy().to_string());

            for n in 1..=32 {
                let input_path = hwmon_dir.join(format!("temp{n}_input"));

                if !input_path.exists() {
                    continue;
                }

                let label = read_trimmed(&hwmon_dir.join(format!("temp{n}_label")))
                    .unwrap_or_else(|| format!("temp{n}"));

                sensors.push(TempSensor {
                    label: format!("{hwmon_name} {label}"),
                    input_path,
                });
            }
        }

        sensors.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(sensors)
    }

    /// Discover and read every input on the calling thread.
    ///
    /// sysfs reads can stall (a GPU waking from runtime suspend), so async
    /// callers go through [`SensorSource::read`] instead.
    pub fn scan(&self) -> Readings {
        let sensors = match self.discover() {
            Ok(sensors) => sensors,
            Err(e) => {
                log::debug!("Failed to scan {}: {e}", self.root.display());
                return Readings::new();
            }
        };

        let mut readings = Readings::new();
        for sensor in sensors {
            if let Some(temp_c) = read_temp_c(&sensor.input_path) {
                // Duplicate labels (two identical chips) keep the hotter one.
                readings
                    .entry(sensor.label)
                    .and_modify(|t| *t = t.max(temp_c))
                    .or_insert(temp_c);
            }
        }
        readings
    }
}

#[async_trait]
impl SensorSource for HwmonSensors {
    async fn read(&self) -> Readings {
        let source = self.clone();
        match tokio::task::spawn_blocking(move || source.scan()).await {
            Ok(readings) => readings,
            Err(e) => {
                log::error!("Sensor scan task failed: {e}");
                Readings::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_temp_c(path: &Path) -> Option<f64> {
    read_trimmed(path)
        .and_then(|s| s.parse::<i64>().ok())
        .map(|millic| millic as f64 / 1000.0)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
