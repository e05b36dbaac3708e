use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use btleplug::api::BDAddr;
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::Model;
use crate::radio;
use crate::sensor_client::SensorClient;

/// Quality assigned to a device that has not been polled yet
const INITIAL_QUALITY: u8 = 33;
/// Below this quality the per-poll report is logged at info level
const WARNING_QUALITY: u8 = 15;
/// Battery estimate assigned to a device that has not been polled yet
const INITIAL_BATTERY: f32 = 50.0;
/// Fail score at which a device is put on hold
const HOLD_FAILS: u32 = 3;
/// How long a failing device is left alone
const HOLD_DURATION: Duration = Duration::from_secs(3 * 3600);
/// Minimum time between radio resets
const RADIO_RESET_COOLDOWN: Duration = Duration::from_secs(3600);
/// How many response times feed the rolling median
const RESPONSE_WINDOW: usize = 100;
/// Timeout applied to every managed client, slightly above the LYWSD02
/// default so both models fit
const NOTIFICATION_TIMEOUT: Duration = Duration::from_millis(11_500);

/// Last known state of a managed device.
///
/// `update` never fails; poll errors degrade `quality` and `battery`
/// instead so callers can keep serving the previous reading while the
/// score tells them how much to trust it.
#[derive(Clone, Debug)]
pub struct DeviceState {
    pub mac: BDAddr,
    pub dev_id: String,
    /// Quality of service, 0 to 100
    pub quality: u8,
    /// Battery charge estimate in %. Halved on every failed poll to force
    /// attention to the device.
    pub battery: f32,
    pub temperature: Option<f32>,
    pub humidity: Option<u8>,
    pub voltage: Option<f32>,
    /// When the device was last polled (successfully or not)
    pub measured_at: Option<DateTime<Local>>,
    /// `measured_at` as a UNIX timestamp
    pub epoch: Option<i64>,
}

struct ManagedDevice {
    client: SensorClient,
    state: DeviceState,
    next_poll: Instant,
    fail: u32,
}

/// Supervises a fleet of sensors: polls them periodically, scores their
/// quality of service and takes radio-level countermeasures when devices
/// keep failing.
pub struct SensorManager {
    devices: BTreeMap<String, ManagedDevice>,
    response_times: Vec<f64>,
    median_response_time: f64,
    radio_reset_allowed_at: Instant,
}

impl SensorManager {
    /// Create a manager. With `reset_hardware` the Bluetooth radio is
    /// power-cycled first, which helps after an unclean shutdown.
    pub async fn new(reset_hardware: bool) -> Self {
        info!("initialising sensor manager");
        if reset_hardware {
            if let Err(e) = radio::ble_reset(radio::DEFAULT_RESET_SETTLE).await {
                error!("radio reset failed: {e}");
            }
        }
        let initial_median = NOTIFICATION_TIMEOUT.as_secs_f64();
        Self {
            devices: BTreeMap::new(),
            response_times: vec![initial_median],
            median_response_time: initial_median,
            radio_reset_allowed_at: Instant::now(),
        }
    }

    /// Register a device. `dev_id` is the name used to refer to the device
    /// later; when empty the MAC address is used.
    pub fn subscribe_to(&mut self, mac: &str, dev_id: &str, model: Model) -> Result<()> {
        let dev_id = if dev_id.is_empty() {
            mac.to_string()
        } else {
            dev_id.to_string()
        };
        let client = SensorClient::new(model, mac)?.with_notification_timeout(NOTIFICATION_TIMEOUT);
        info!("created {model} client for {mac}");
        let state = DeviceState {
            mac: client.address(),
            dev_id: dev_id.clone(),
            quality: INITIAL_QUALITY,
            battery: INITIAL_BATTERY,
            temperature: None,
            humidity: None,
            voltage: None,
            measured_at: None,
            epoch: None,
        };
        self.devices.insert(
            dev_id,
            ManagedDevice {
                client,
                state,
                next_poll: Instant::now(),
                fail: 0,
            },
        );
        self.response_times.push(self.median_response_time);
        Ok(())
    }

    /// Last known state of the given device, or `None` for an unknown id.
    pub fn get_state_of(&self, dev_id: &str) -> Option<&DeviceState> {
        let state = self.devices.get(dev_id).map(|device| &device.state);
        debug!("{dev_id}: {state:?}");
        state
    }

    /// States of all managed devices.
    pub fn states(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values().map(|device| &device.state)
    }

    /// Poll one device and fold the outcome into its state. Errors are
    /// absorbed: a failed poll lowers the quality score and battery
    /// estimate but the previous reading stays available.
    pub async fn update(&mut self, dev_id: &str) {
        let Some(device) = self.devices.get_mut(dev_id) else {
            warn!("update requested for unknown device {dev_id}");
            return;
        };
        let started = Instant::now();
        let mut excepted = false;
        match device.client.data().await {
            Ok(data) => {
                device.state.temperature = Some(data.temperature);
                device.state.humidity = Some(data.humidity);
                device.state.voltage = data.voltage;
                if let Some(battery) = data.battery {
                    device.state.battery = battery;
                }
            }
            Err(e @ Error::Timeout { .. }) => {
                excepted = true;
                warn!("while talking to {dev_id}: {e}");
                // The device did not disconnect properly.
                radio::force_disconnect(&device.state.mac.to_string()).await;
            }
            Err(e @ (Error::Connect { .. } | Error::DeviceNotFound { .. })) => {
                excepted = true;
                error!("while connecting to {dev_id}: {e}");
                radio::force_disconnect(&device.state.mac.to_string()).await;
            }
            Err(e) => {
                excepted = true;
                error!("while talking to {dev_id} ({}): {e}", device.state.mac);
            }
        }

        let now = Local::now();
        device.state.measured_at = Some(now);
        device.state.epoch = Some(now.timestamp());

        let battery = device.state.battery;
        let previous_quality = device.state.quality;
        let response_time = started.elapsed().as_secs_f64();

        if excepted {
            // The battery level is unreliable after a failure, adjust it
            // downwards to force action.
            device.state.battery /= 2.0;
        }

        let valid = device.state.temperature.is_some();
        let response_ratio = if valid {
            self.response_times.push(response_time);
            if self.response_times.len() > RESPONSE_WINDOW {
                self.response_times.remove(0);
            }
            self.median_response_time = median(&self.response_times);
            debug!("{dev_id} median response time: {}", self.median_response_time);
            (self.median_response_time / response_time).min(1.0)
        } else {
            0.0
        };

        let quality = quality_score(previous_quality, battery, response_ratio, excepted, valid);
        let report = format!(
            "{dev_id}: soc({battery:.1}) rt({response_ratio:.4} | {:.1}s) prev({previous_quality}) => QoS({quality})",
            self.median_response_time
        );
        if quality < WARNING_QUALITY || excepted {
            info!("{report}");
        } else {
            debug!("{report}");
        }
        device.state.quality = quality;

        if excepted || quality < 6 {
            device.fail += 1;
            info!("{dev_id}: fail score: {}", device.fail);
        } else {
            device.fail = device.fail.saturating_sub(1);
        }
    }

    /// Poll every device that is not on hold, then handle failing devices.
    pub async fn update_all(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, device)| now >= device.next_poll)
            .map(|(dev_id, _)| dev_id.clone())
            .collect();
        for dev_id in due {
            self.update(&dev_id).await;
            if let Some(device) = self.devices.get_mut(&dev_id) {
                device.next_poll = Instant::now();
            }
        }
        self.handle_fails().await;
    }

    /// Put devices that keep failing on hold, and reset the radio when at
    /// least half the fleet is failing (at most once per cooldown).
    async fn handle_fails(&mut self) {
        let mut fail_count = 0;
        for device in self.devices.values_mut() {
            if device.fail >= HOLD_FAILS {
                warn!("putting device {} on hold", device.state.dev_id);
                info!("{:?}", device.state);
                device.next_poll = Instant::now() + HOLD_DURATION;
                // Lower the score so the hold is not permanent.
                device.fail -= 2;
            }
            if device.fail > 0 {
                fail_count += 1;
            }
        }
        if fail_count == 0 {
            return;
        }

        let device_count = self.devices.len();
        if fail_count >= device_count / 2 && Instant::now() >= self.radio_reset_allowed_at {
            warn!("fail count = {fail_count}");
            if let Err(e) = radio::ble_reset(radio::DEFAULT_RESET_SETTLE).await {
                error!("radio reset failed: {e}");
            }
            self.radio_reset_allowed_at = Instant::now() + RADIO_RESET_COOLDOWN;
        } else {
            info!("fail count = {fail_count}");
        }
    }
}

/// Quality of service for one poll outcome, 0 to 100.
///
/// The score is the mean of the previous score and soc * rt * penalty, so
/// it moves gradually. Scores that drop to 6 or below collapse to 0, since
/// the running mean would otherwise take too long to get there.
fn quality_score(
    previous: u8,
    battery_pct: f32,
    response_ratio: f64,
    excepted: bool,
    valid: bool,
) -> u8 {
    if !valid {
        // No data at all, nothing to rate.
        return 0;
    }
    let penalty = if excepted {
        // There is still old data, but value it less on every failure so
        // the score approaches 0 eventually.
        (f64::from(WARNING_QUALITY) / 100.0).sqrt()
    } else {
        1.0
    };
    let soc = f64::from(battery_pct) / 100.0;
    let previous = f64::from(previous) / 100.0;
    let mut quality = ((previous + soc * response_ratio * penalty) / 2.0).min(1.0);
    if quality <= 0.06 {
        quality = 0.0;
    }
    (quality * 100.0) as u8
}

/// Median of a non-empty slice. Averages the two middle values for even
/// lengths.
fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[test]
fn test_quality_score_without_data_is_zero() {
    assert_eq!(quality_score(100, 100.0, 1.0, false, false), 0);
}

#[test]
fn test_quality_score_healthy_device_stays_high() {
    // Full battery, fast responses: the running mean keeps the score at 100.
    assert_eq!(quality_score(100, 100.0, 1.0, false, true), 100);
}

#[test]
fn test_quality_score_failure_degrades() {
    let degraded = quality_score(100, 50.0, 1.0, true, true);
    let healthy = quality_score(100, 50.0, 1.0, false, true);
    assert!(degraded < healthy);
    assert!(degraded > 0);
}

#[test]
fn test_quality_score_collapses_near_zero() {
    assert_eq!(quality_score(10, 2.0, 0.1, true, true), 0);
}

#[test]
fn test_quality_score_converges_towards_zero_under_repeated_failures() {
    let mut quality = INITIAL_QUALITY;
    for _ in 0..20 {
        quality = quality_score(quality, 5.0, 1.0, true, true);
    }
    assert_eq!(quality, 0);
}

#[test]
fn test_median_odd() {
    assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
}

#[test]
fn test_median_even() {
    assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
}

#[test]
fn test_median_single() {
    assert_eq!(median(&[11.5]), 11.5);
}
