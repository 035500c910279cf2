// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The fan speed control loop.
//!
//! A [`Controller`] owns the device link and runs one periodic task that:
//!
//! 1. reconnects the device if needed (direct connect, then port discovery),
//! 2. reads CPU/GPU temperatures,
//! 3. reads the duty the device currently reports,
//! 4. computes a target: in AUTO mode the curve value, step-limited and
//!    dead-banded against the reported duty; in MANUAL mode the set value,
//! 5. writes it if it differs.
//!
//! Sensor reads and port enumeration are bounded by `io_timeout`.
//!
//! Stopping the controller always leaves a connected device at duty 0.

use crate::config::Config;
use crate::curve::RangeTable;
use crate::device::DeviceLink;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::ports::{self, PortEnumerator, PortFilter};
use crate::sensors::{self, Readings, SensorSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// While disconnected, every Nth failed attempt is logged at info level.
const RECONNECT_LOG_EVERY: u32 = 10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where the duty target comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Derived from CPU/GPU temperatures.
    #[default]
    Auto,
    /// Fixed at the manual speed.
    Manual,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => write!(f, "AUTO"),
            Mode::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Snapshot of what the controller knows.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub mode: Mode,
    /// Duty used in MANUAL mode, 0-100
    pub manual_speed: u8,
    pub running: bool,
    pub connected: bool,
    pub cpu_temp: f64,
    pub gpu_temp: f64,
    /// Last duty known to be applied on the device
    pub current_speed: u8,
}

/// Immutable control parameters.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub delay: Duration,
    /// Bound on a sensor read or port enumeration
    pub io_timeout: Duration,
    pub ranges: RangeTable,
    pub limiter: RateLimiter,
    pub port_filter: PortFilter,
    pub cpu_filters: Vec<String>,
    pub gpu_filters: Vec<String>,
    /// Initial mode
    pub mode: Mode,
    /// Initial manual speed
    pub manual_speed: u8,
}

impl ControlSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            delay: Duration::from_millis(cfg.control.delay_ms),
            io_timeout: Duration::from_millis(cfg.control.io_timeout_ms),
            ranges: cfg.control.temp_ranges.clone(),
            limiter: RateLimiter::new(
                Some(cfg.control.max_step).filter(|s| *s > 0),
                cfg.control.dead_band,
            ),
            port_filter: PortFilter::new(cfg.device.name.clone(), cfg.device.serial.clone()),
            cpu_filters: cfg.sensors.cpu_filters.clone(),
            gpu_filters: cfg.sensors.gpu_filters.clone(),
            mode: cfg.control.mode,
            manual_speed: cfg.control.manual_speed.min(100),
        }
    }
}

pub type StatusObserver = Box<dyn Fn(bool, bool) + Send + Sync>;
pub type TempsObserver = Box<dyn Fn(f64, f64) + Send + Sync>;
pub type SpeedObserver = Box<dyn Fn(u8) + Send + Sync>;

/// Callbacks fired from the control task.
///
/// They run synchronously inside the tick and must not block; hand off to a
/// channel if real work is needed.
#[derive(Default)]
pub struct Observers {
    on_status: Option<StatusObserver>,
    on_temps: Option<TempsObserver>,
    on_speed: Option<SpeedObserver>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(connected, running)`.
    pub fn on_status(mut self, f: impl Fn(bool, bool) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    /// Called with `(cpu_temp, gpu_temp)` when either changes.
    pub fn on_temps(mut self, f: impl Fn(f64, f64) + Send + Sync + 'static) -> Self {
        self.on_temps = Some(Box::new(f));
        self
    }

    /// Called with the new applied duty when it changes.
    pub fn on_speed(mut self, f: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_speed = Some(Box::new(f));
        self
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Shared {
    settings: ControlSettings,
    device: Mutex<Box<dyn DeviceLink>>,
    sensors: Box<dyn SensorSource>,
    ports: Box<dyn PortEnumerator>,
    state: Mutex<ControllerState>,
    observers: Observers,
}

struct LoopTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-task bookkeeping that only matters for log noise.
#[derive(Default)]
struct TickContext {
    disconnected_ticks: u32,
    sensors_down: bool,
}

pub struct Controller {
    shared: Arc<Shared>,
    task: Option<LoopTask>,
}

impl Controller {
    pub fn new(
        settings: ControlSettings,
        device: Box<dyn DeviceLink>,
        sensors: Box<dyn SensorSource>,
        ports: Box<dyn PortEnumerator>,
        observers: Observers,
    ) -> Self {
        let state = ControllerState {
            mode: settings.mode,
            manual_speed: settings.manual_speed.min(100),
            running: false,
            connected: false,
            cpu_temp: 0.0,
            gpu_temp: 0.0,
            current_speed: 0,
        };

        Self {
            shared: Arc::new(Shared {
                settings,
                device: Mutex::new(device),
                sensors,
                ports,
                state: Mutex::new(state),
                observers,
            }),
            task: None,
        }
    }

    pub async fn state(&self) -> ControllerState {
        self.shared.state.lock().await.clone()
    }

    pub async fn mode(&self) -> Mode {
        self.shared.state.lock().await.mode
    }

    pub async fn set_mode(&self, mode: Mode) {
        let mut st = self.shared.state.lock().await;
        if st.mode != mode {
            st.mode = mode;
            log::info!("Mode changed to {mode}");
        }
    }

    pub async fn manual_speed(&self) -> u8 {
        self.shared.state.lock().await.manual_speed
    }

    /// Set the MANUAL mode duty, clamped to 0-100. Returns the stored value.
    pub async fn set_manual_speed(&self, speed: i32) -> u8 {
        let speed = speed.clamp(0, 100) as u8;
        self.shared.state.lock().await.manual_speed = speed;
        log::debug!("Manual speed set to {speed}");
        speed
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Port the device link currently targets.
    pub async fn port(&self) -> String {
        self.shared.device.lock().await.port().to_string()
    }

    /// Spawn the control task. No-op if it is already running.
    pub async fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        self.shared.state.lock().await.running = true;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.shared), cancel.clone()));
        self.task = Some(LoopTask { cancel, handle });

        self.shared.notify_status().await;
        log::info!("Control loop started");
    }

    /// Cancel the control task, wait for it, and set a connected device to 0.
    /// No-op if not running.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            log::error!("Control loop ended abnormally: {e}");
        }

        {
            let mut device = self.shared.device.lock().await;
            if device.is_connected() {
                log::info!("Setting fan to 0");
                if device.write_duty(0).await {
                    self.shared.update_speed(0).await;
                }
            }
        }

        self.shared.state.lock().await.running = false;
        self.shared.notify_status().await;
        log::info!("Control loop stopped");
    }

    /// Stop, then release the device. Meant as the last call before exit.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.shared.device.lock().await.disconnect().await;
        self.shared.state.lock().await.connected = false;
        self.shared.notify_status().await;
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Control task
// ---------------------------------------------------------------------------

async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = time::interval(shared.settings.delay);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ctx = TickContext::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Dropping the tick future on cancel abandons a slow reconnect or
        // serial exchange midway; stop() then takes the device lock.
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = shared.tick(&mut ctx) => {
                if let Err(e) = result {
                    log::error!("Error in control loop: {e}");
                    shared.set_connected(false).await;
                    shared.notify_status().await;
                }
            }
        }
    }

    log::debug!("Control loop cancelled");
}

impl Shared {
    async fn tick(&self, ctx: &mut TickContext) -> Result<()> {
        let mut device = self.device.lock().await;

        if !device.is_connected() {
            self.reconnect(&mut **device).await?;
        }

        let connected = device.is_connected();
        let was_connected = self.set_connected(connected).await;
        if connected && !was_connected {
            log::info!("Device connected on {}", device.port());
        } else if !connected && was_connected {
            log::warn!("Device on {} disconnected", device.port());
        }

        if !connected {
            ctx.disconnected_ticks = ctx.disconnected_ticks.saturating_add(1);
            if ctx.disconnected_ticks % RECONNECT_LOG_EVERY == 1 {
                log::info!(
                    "No device connected, retrying (attempt {})",
                    ctx.disconnected_ticks
                );
            } else {
                log::debug!("No device connected (attempt {})", ctx.disconnected_ticks);
            }
            self.notify_status().await;
            return Ok(());
        }
        ctx.disconnected_ticks = 0;

        let readings = match time::timeout(self.settings.io_timeout, self.sensors.read()).await {
            Ok(readings) => readings,
            Err(_) => {
                log::debug!("Sensor read timed out after {:?}", self.settings.io_timeout);
                Readings::new()
            }
        };
        if readings.is_empty() {
            if !ctx.sensors_down {
                log::error!("No temperature readings available, assuming 0");
                ctx.sensors_down = true;
            }
        } else if ctx.sensors_down {
            log::info!("Temperature readings restored");
            ctx.sensors_down = false;
        }

        let (cpu, gpu) = sensors::split_temperatures(
            &readings,
            &self.settings.cpu_filters,
            &self.settings.gpu_filters,
        );
        self.update_temps(cpu, gpu).await;

        let reported = device.read_duty().await;

        let (mode, manual_speed) = {
            let st = self.state.lock().await;
            (st.mode, st.manual_speed)
        };
        let target = match mode {
            Mode::Auto => {
                let ranges = &self.settings.ranges;
                let raw = ranges.evaluate(cpu).max(ranges.evaluate(gpu));
                self.settings.limiter.apply(raw, reported)
            }
            Mode::Manual => manual_speed,
        };

        if reported != Some(target) {
            log::info!(
                "CPU: {cpu}, GPU: {gpu}. Duty: {} -> {target}",
                reported.map_or_else(|| "unknown".to_string(), |d| d.to_string())
            );
            if device.write_duty(target).await {
                self.update_speed(target).await;
            }
        } else if let Some(duty) = reported {
            self.update_speed(duty).await;
        }

        Ok(())
    }

    /// Try the configured port, then look for the device by name/serial.
    async fn reconnect(&self, device: &mut dyn DeviceLink) -> Result<()> {
        if device.connect().await {
            return Ok(());
        }

        let filter = &self.settings.port_filter;
        if filter.is_empty() {
            log::debug!("No device name or serial configured, skipping port discovery");
            return Ok(());
        }

        let available = time::timeout(self.settings.io_timeout, self.ports.list())
            .await
            .map_err(|_| Error::Timeout("Port enumeration"))??;
        match ports::resolve(&available, filter) {
            Some(found) if found.device != device.port() => {
                log::info!("Serial device found at {}", found.device);
                device.set_port(found.device.clone());
                device.connect().await;
            }
            Some(found) => {
                log::debug!("Matching port {} is the one that just failed", found.device);
            }
            None => {
                log::debug!(
                    "No serial port matches name {:?} / serial {:?}",
                    filter.name,
                    filter.serial
                );
            }
        }
        Ok(())
    }

    /// Record the connected flag, notifying on change. Returns the old value.
    async fn set_connected(&self, connected: bool) -> bool {
        let previous = {
            let mut st = self.state.lock().await;
            std::mem::replace(&mut st.connected, connected)
        };
        if previous != connected {
            self.notify_status().await;
        }
        previous
    }

    async fn update_temps(&self, cpu: f64, gpu: f64) {
        let changed = {
            let mut st = self.state.lock().await;
            let changed = st.cpu_temp != cpu || st.gpu_temp != gpu;
            st.cpu_temp = cpu;
            st.gpu_temp = gpu;
            changed
        };
        if changed {
            log::debug!("CPU: {cpu}, GPU: {gpu}");
            if let Some(f) = &self.observers.on_temps {
                f(cpu, gpu);
            }
        }
    }

    async fn update_speed(&self, speed: u8) {
        let previous = {
            let mut st = self.state.lock().await;
            std::mem::replace(&mut st.current_speed, speed)
        };
        if previous != speed {
            if let Some(f) = &self.observers.on_speed {
                f(speed);
            }
        }
    }

    async fn notify_status(&self) {
        let (connected, running) = {
            let st = self.state.lock().await;
            (st.connected, st.running)
        };
        if let Some(f) = &self.observers.on_status {
            f(connected, running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortInfo;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    // -- fakes --------------------------------------------------------------

    #[derive(Debug, Default)]
    struct DeviceLog {
        reachable_port: Option<String>,
        connected: bool,
        duty: Option<u8>,
        writes: Vec<u8>,
        reads: usize,
        connects: usize,
        /// Time each duty query takes to answer
        read_delay: Option<Duration>,
    }

    struct FakeDevice {
        port: String,
        log: Arc<StdMutex<DeviceLog>>,
    }

    #[async_trait]
    impl DeviceLink for FakeDevice {
        async fn connect(&mut self) -> bool {
            let mut log = self.log.lock().unwrap();
            log.connects += 1;
            if log.reachable_port.as_deref() == Some(self.port.as_str()) {
                log.connected = true;
            }
            log.connected
        }

        async fn disconnect(&mut self) {
            self.log.lock().unwrap().connected = false;
        }

        fn is_connected(&self) -> bool {
            self.log.lock().unwrap().connected
        }

        async fn read_duty(&mut self) -> Option<u8> {
            let delay = self.log.lock().unwrap().read_delay;
            if let Some(delay) = delay {
                time::sleep(delay).await;
            }
            let mut log = self.log.lock().unwrap();
            log.reads += 1;
            if log.connected { log.duty } else { None }
        }

        async fn write_duty(&mut self, value: u8) -> bool {
            let mut log = self.log.lock().unwrap();
            if !log.connected {
                return false;
            }
            log.writes.push(value);
            log.duty = Some(value);
            true
        }

        fn port(&self) -> &str {
            &self.port
        }

        fn set_port(&mut self, port: String) {
            self.port = port;
        }
    }

    struct FakeSensors {
        readings: Readings,
        delay: Duration,
    }

    #[async_trait]
    impl SensorSource for FakeSensors {
        async fn read(&self) -> Readings {
            time::sleep(self.delay).await;
            self.readings.clone()
        }
    }

    struct FakePorts {
        ports: Vec<PortInfo>,
        fail: bool,
    }

    #[async_trait]
    impl PortEnumerator for FakePorts {
        async fn list(&self) -> Result<Vec<PortInfo>> {
            if self.fail {
                return Err(Error::Io(std::io::Error::other("enumeration failed")));
            }
            Ok(self.ports.clone())
        }
    }

    // -- harness ------------------------------------------------------------

    const PORT: &str = "/dev/ttyUSB0";

    fn settings() -> ControlSettings {
        ControlSettings {
            delay: Duration::from_millis(1100),
            io_timeout: Duration::from_millis(1000),
            ranges: RangeTable::default(),
            limiter: RateLimiter::new(Some(10), 3),
            port_filter: PortFilter::new(Some("CH9102".into()), None),
            cpu_filters: vec!["k10temp".into()],
            gpu_filters: vec!["amdgpu".into()],
            mode: Mode::Auto,
            manual_speed: 20,
        }
    }

    fn readings(cpu: f64, gpu: f64) -> Readings {
        [
            ("k10temp Tctl".to_string(), cpu),
            ("amdgpu edge".to_string(), gpu),
        ]
        .into_iter()
        .collect()
    }

    struct Harness {
        controller: Controller,
        device: Arc<StdMutex<DeviceLog>>,
    }

    fn harness_with(
        reachable_port: Option<&str>,
        duty: Option<u8>,
        temps: Readings,
        ports: FakePorts,
        observers: Observers,
    ) -> Harness {
        let device = Arc::new(StdMutex::new(DeviceLog {
            reachable_port: reachable_port.map(str::to_string),
            duty,
            ..Default::default()
        }));
        let controller = Controller::new(
            settings(),
            Box::new(FakeDevice {
                port: PORT.to_string(),
                log: Arc::clone(&device),
            }),
            Box::new(FakeSensors {
                readings: temps,
                delay: Duration::ZERO,
            }),
            Box::new(ports),
            observers,
        );
        Harness { controller, device }
    }

    fn harness(duty: Option<u8>, temps: Readings) -> Harness {
        harness_with(
            Some(PORT),
            duty,
            temps,
            FakePorts {
                ports: Vec::new(),
                fail: false,
            },
            Observers::new(),
        )
    }

    async fn settle() {
        time::sleep(Duration::from_millis(100)).await;
    }

    fn writes(h: &Harness) -> Vec<u8> {
        h.device.lock().unwrap().writes.clone()
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_auto_mode_writes_curve_duty() {
        let mut h = harness(Some(0), readings(60.4, 40.0));
        h.controller.start().await;
        settle().await;

        assert_eq!(writes(&h), vec![16]);
        let st = h.controller.state().await;
        assert!(st.connected && st.running);
        assert_eq!(st.cpu_temp, 60.0);
        assert_eq!(st.gpu_temp, 40.0);
        assert_eq!(st.current_speed, 16);

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotter_sensor_group_wins() {
        let mut h = harness(Some(0), readings(40.0, 95.0));
        h.controller.start().await;
        settle().await;

        assert_eq!(writes(&h), vec![87]);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spin_down_is_gradual() {
        let mut h = harness(Some(50), readings(35.0, 35.0));
        h.controller.start().await;
        settle().await;
        assert_eq!(writes(&h), vec![40]);

        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(writes(&h), vec![40, 30]);

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_band_adopts_reported_duty() {
        let mut h = harness(Some(15), readings(60.0, 0.0));
        h.controller.start().await;
        settle().await;

        assert!(writes(&h).is_empty());
        assert_eq!(h.controller.state().await.current_speed, 15);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_duty_writes_raw_target() {
        let mut h = harness(None, readings(95.0, 0.0));
        h.controller.start().await;
        settle().await;

        assert_eq!(writes(&h), vec![87]);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_uses_clamped_speed() {
        let mut h = harness(Some(0), readings(95.0, 95.0));
        h.controller.set_mode(Mode::Manual).await;
        assert_eq!(h.controller.set_manual_speed(150).await, 100);
        assert_eq!(h.controller.set_manual_speed(-5).await, 0);
        assert_eq!(h.controller.set_manual_speed(55).await, 55);

        h.controller.start().await;
        settle().await;
        assert_eq!(writes(&h), vec![55]);

        h.controller.set_mode(Mode::Auto).await;
        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(writes(&h), vec![55, 87]);
        assert_eq!(h.controller.mode().await, Mode::Auto);

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_speed_bypasses_dead_band() {
        let mut h = harness(Some(50), readings(40.0, 40.0));
        h.controller.set_mode(Mode::Manual).await;
        h.controller.set_manual_speed(52).await;
        h.controller.start().await;
        settle().await;

        assert_eq!(writes(&h), vec![52]);
        assert_eq!(h.controller.state().await.current_speed, 52);

        // Held on later ticks.
        time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(writes(&h), vec![52]);

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_drop_is_not_step_limited() {
        let mut h = harness(Some(80), readings(95.0, 95.0));
        h.controller.set_mode(Mode::Manual).await;
        h.controller.set_manual_speed(0).await;
        h.controller.start().await;
        settle().await;

        assert_eq!(writes(&h), vec![0]);
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_writes_zero() {
        let mut h = harness(Some(0), readings(95.0, 0.0));
        h.controller.start().await;
        settle().await;

        h.controller.stop().await;
        assert_eq!(writes(&h).last(), Some(&0));
        let st = h.controller.state().await;
        assert!(!st.running);
        assert_eq!(st.current_speed, 0);
        assert!(!h.controller.is_running());

        // Second stop is a no-op.
        let count = writes(&h).len();
        h.controller.stop().await;
        assert_eq!(writes(&h).len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_disconnected_writes_nothing() {
        let mut h = harness_with(
            None,
            Some(40),
            readings(60.0, 0.0),
            FakePorts {
                ports: Vec::new(),
                fail: false,
            },
            Observers::new(),
        );
        h.controller.start().await;
        settle().await;
        h.controller.stop().await;

        assert!(writes(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_tick_in_flight() {
        let mut h = harness(Some(50), readings(95.0, 0.0));
        h.device.lock().unwrap().read_delay = Some(Duration::from_secs(30));
        h.controller.start().await;
        settle().await;

        let begun = time::Instant::now();
        h.controller.stop().await;

        assert!(begun.elapsed() < Duration::from_millis(1100));
        assert_eq!(writes(&h), vec![0]);
        assert!(!h.controller.state().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sensor_read_is_bounded() {
        let device = Arc::new(StdMutex::new(DeviceLog {
            reachable_port: Some(PORT.to_string()),
            duty: Some(50),
            ..Default::default()
        }));
        let mut controller = Controller::new(
            settings(),
            Box::new(FakeDevice {
                port: PORT.to_string(),
                log: Arc::clone(&device),
            }),
            Box::new(FakeSensors {
                readings: readings(95.0, 95.0),
                delay: Duration::from_secs(60),
            }),
            Box::new(FakePorts {
                ports: Vec::new(),
                fail: false,
            }),
            Observers::new(),
        );
        controller.start().await;

        // The read gives up after io_timeout and the tick runs on 0 degrees.
        time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(device.lock().unwrap().writes, vec![40]);
        let st = controller.state().await;
        assert_eq!((st.cpu_temp, st.gpu_temp), (0.0, 0.0));
        assert!(st.connected);

        // Stopping during the next stalled read still returns promptly.
        time::sleep(Duration::from_millis(300)).await;
        let begun = time::Instant::now();
        controller.stop().await;
        assert!(begun.elapsed() < Duration::from_millis(1100));
        assert_eq!(device.lock().unwrap().writes, vec![40, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let mut h = harness(Some(0), readings(60.0, 0.0));
        h.controller.start().await;
        h.controller.start().await;
        time::sleep(Duration::from_millis(3500)).await;

        // Ticks at 0, 1.1, 2.2 and 3.3 seconds from a single task.
        let reads = h.device.lock().unwrap().reads;
        assert!((3..=4).contains(&reads), "unexpected read count {reads}");

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_through_port_discovery() {
        let ports = FakePorts {
            ports: vec![
                PortInfo {
                    description: "Other adapter (/dev/ttyACM1)".into(),
                    serial_number: Some("111".into()),
                    device: "/dev/ttyACM1".into(),
                },
                PortInfo {
                    description: "USB-Enhanced-SERIAL CH9102 (/dev/ttyACM3)".into(),
                    serial_number: Some("222".into()),
                    device: "/dev/ttyACM3".into(),
                },
            ],
            fail: false,
        };
        let mut h = harness_with(
            Some("/dev/ttyACM3"),
            Some(0),
            readings(60.0, 0.0),
            ports,
            Observers::new(),
        );
        h.controller.start().await;
        settle().await;

        assert_eq!(h.controller.port().await, "/dev/ttyACM3");
        assert!(h.controller.state().await.connected);
        assert_eq!(writes(&h), vec![16]);

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_matching_port_keeps_polling() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observers = Observers::new().on_status(move |connected, running| {
            sink.lock().unwrap().push((connected, running));
        });

        let mut h = harness_with(
            None,
            None,
            readings(60.0, 0.0),
            FakePorts {
                ports: Vec::new(),
                fail: false,
            },
            observers,
        );
        h.controller.start().await;
        time::sleep(Duration::from_millis(2500)).await;

        let st = h.controller.state().await;
        assert!(st.running);
        assert!(!st.connected);
        assert!(h.device.lock().unwrap().connects >= 3);

        let events = events.lock().unwrap().clone();
        assert!(events.len() >= 3);
        assert!(events.iter().all(|(connected, running)| !connected && *running));

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_error_does_not_stop_loop() {
        let mut h = harness_with(
            None,
            None,
            Readings::new(),
            FakePorts {
                ports: Vec::new(),
                fail: true,
            },
            Observers::new(),
        );
        h.controller.start().await;
        time::sleep(Duration::from_millis(2500)).await;

        assert!(h.controller.is_running());
        assert!(!h.controller.state().await.connected);
        assert!(h.device.lock().unwrap().connects >= 3);

        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_fire_on_change_only() {
        let temps = Arc::new(StdMutex::new(Vec::new()));
        let speeds = Arc::new(StdMutex::new(Vec::new()));
        let (temps_sink, speeds_sink) = (Arc::clone(&temps), Arc::clone(&speeds));
        let observers = Observers::new()
            .on_temps(move |cpu, gpu| temps_sink.lock().unwrap().push((cpu, gpu)))
            .on_speed(move |speed| speeds_sink.lock().unwrap().push(speed));

        let mut h = harness_with(
            Some(PORT),
            Some(0),
            readings(60.0, 30.0),
            FakePorts {
                ports: Vec::new(),
                fail: false,
            },
            observers,
        );
        h.controller.start().await;
        time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(temps.lock().unwrap().clone(), vec![(60.0, 30.0)]);
        assert_eq!(speeds.lock().unwrap().clone(), vec![16]);

        h.controller.stop().await;
        assert_eq!(speeds.lock().unwrap().clone(), vec![16, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sensors_read_as_zero() {
        let mut h = harness(Some(0), Readings::new());
        h.controller.start().await;
        settle().await;

        let st = h.controller.state().await;
        assert_eq!((st.cpu_temp, st.gpu_temp), (0.0, 0.0));
        assert!(writes(&h).is_empty());
        h.controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let mut h = harness(Some(0), readings(95.0, 0.0));
        h.controller.start().await;
        settle().await;
        h.controller.shutdown().await;

        assert_eq!(writes(&h).last(), Some(&0));
        assert!(!h.device.lock().unwrap().connected);
        let st = h.controller.state().await;
        assert!(!st.connected && !st.running);
    }

    #[test]
    fn test_settings_from_config() {
        let mut cfg = Config::default();
        cfg.control.max_step = 0;
        cfg.device.name = Some(String::new());
        cfg.device.serial = Some("5A7B".into());

        let settings = ControlSettings::from_config(&cfg);
        assert_eq!(settings.limiter.max_step, None);
        assert_eq!(settings.limiter.dead_band, cfg.control.dead_band);
        assert_eq!(settings.port_filter, PortFilter::new(None, Some("5A7B".into())));
        assert_eq!(settings.delay, Duration::from_millis(1100));
        assert_eq!(settings.io_timeout, Duration::from_millis(1000));
    }
}
