use std::collections::BTreeMap;
use std::time::{Duration, Instant, UNIX_EPOCH};

use btleplug::api::{BDAddr, Central as _, Characteristic, Manager as _, Peripheral as _};
use btleplug::api::{ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::{DateTime, Local, TimeDelta};
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{history_message, sensor_message, time_message};
use crate::model::{Model, TemperatureUnit};
use crate::sensor_data::{HistoryRecord, SensorData};

// GATT characteristics shared by both models.
const UUID_UNITS: Uuid = Uuid::from_u128(0xebe0ccbe_7a0a_4b0c_8a1a_6ff2997da3a6); // 1 byte   READ WRITE
const UUID_HISTORY: Uuid = Uuid::from_u128(0xebe0ccbc_7a0a_4b0c_8a1a_6ff2997da3a6); // 14 bytes READ NOTIFY
const UUID_TIME: Uuid = Uuid::from_u128(0xebe0ccb7_7a0a_4b0c_8a1a_6ff2997da3a6); // 5 or 4 bytes READ WRITE
const UUID_DATA: Uuid = Uuid::from_u128(0xebe0ccc1_7a0a_4b0c_8a1a_6ff2997da3a6); // 3 or 5 bytes READ NOTIFY
const UUID_BATTERY: Uuid = Uuid::from_u128(0xebe0ccc4_7a0a_4b0c_8a1a_6ff2997da3a6); // 1 byte   READ
const UUID_NUM_RECORDS: Uuid = Uuid::from_u128(0xebe0ccb9_7a0a_4b0c_8a1a_6ff2997da3a6); // 8 bytes READ
const UUID_RECORD_IDX: Uuid = Uuid::from_u128(0xebe0ccba_7a0a_4b0c_8a1a_6ff2997da3a6); // 4 bytes  READ WRITE

/// How many times a failed connection attempt is repeated before giving up
const CONNECT_RETRIES: usize = 2;
/// How often the discovered-devices list is polled while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Client for a single LYWSD02 or LYWSD03MMC sensor.
///
/// Construction is cheap and performs no I/O. Every operation connects to
/// the device on demand and disconnects when done, so the sensor is not
/// kept awake (and its battery drained) between polls.
pub struct SensorClient {
    model: Model,
    address: BDAddr,
    notification_timeout: Duration,
    tz_offset_hours: Option<i8>,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    // The device start time never changes, and caching it saves a
    // characteristic read per history download.
    start_time: Option<DateTime<Local>>,
}

impl SensorClient {
    /// Create a client for the given model and MAC address, e.g. `"A4:C1:38:01:23:45"`.
    pub fn new(model: Model, mac: &str) -> Result<Self> {
        Ok(Self {
            model,
            address: mac.parse()?,
            notification_timeout: model.notification_timeout(),
            tz_offset_hours: None,
            adapter: None,
            peripheral: None,
            start_time: None,
        })
    }

    /// Create a client for a LYWSD02 device.
    pub fn lywsd02(mac: &str) -> Result<Self> {
        Self::new(Model::Lywsd02, mac)
    }

    /// Create a client for a LYWSD03MMC device.
    pub fn lywsd03(mac: &str) -> Result<Self> {
        Self::new(Model::Lywsd03, mac)
    }

    /// Override the per-model default connection/notification timeout.
    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn address(&self) -> BDAddr {
        self.address
    }

    /// Timezone offset in hours used when writing the device clock.
    /// Defaults to the host's current UTC offset.
    pub fn tz_offset(&self) -> i8 {
        self.tz_offset_hours
            .unwrap_or_else(|| (Local::now().offset().local_minus_utc() / 3600) as i8)
    }

    pub fn set_tz_offset(&mut self, hours: i8) {
        self.tz_offset_hours = Some(hours);
    }

    /// Fetch the current reading from the sensor.
    ///
    /// The sensor pushes a reading as a notification within a few seconds of
    /// subscribing; waiting longer than the notification timeout yields
    /// [`Error::Timeout`].
    pub async fn data(&mut self) -> Result<SensorData> {
        let peripheral = self.connect().await?;
        let result = self.read_sensor_data(&peripheral).await;
        self.disconnect_quietly().await;
        result
    }

    /// Fetch the current temperature in °C.
    pub async fn temperature(&mut self) -> Result<f32> {
        Ok(self.data().await?.temperature)
    }

    /// Fetch the current relative humidity in %.
    pub async fn humidity(&mut self) -> Result<u8> {
        Ok(self.data().await?.humidity)
    }

    /// Fetch the battery charge in %.
    ///
    /// The LYWSD02 exposes a battery characteristic; the LYWSD03MMC reports
    /// its cell voltage with every reading instead, so for that model the
    /// charge is estimated from a fresh reading.
    pub async fn battery(&mut self) -> Result<f32> {
        match self.model {
            Model::Lywsd02 => {
                let peripheral = self.connect().await?;
                let result = self.read_battery_level(&peripheral).await;
                self.disconnect_quietly().await;
                result
            }
            Model::Lywsd03 => self
                .data()
                .await?
                .battery
                .ok_or_else(|| Error::Value("no battery estimate in reading".into())),
        }
    }

    /// Read the device clock: local time and timezone offset in hours.
    ///
    /// Note that the LYWSD03MMC has no real-time clock; its time
    /// characteristic counts seconds since the device started.
    pub async fn time(&mut self) -> Result<(DateTime<Local>, i8)> {
        let peripheral = self.connect().await?;
        let result = self.read_time(&peripheral).await;
        self.disconnect_quietly().await;
        result
    }

    /// Set the device clock to the given time, using the configured
    /// timezone offset. Not supported by the LYWSD03MMC, which has no
    /// visible clock.
    pub async fn set_time(&mut self, time: DateTime<Local>) -> Result<()> {
        if self.model == Model::Lywsd03 {
            return Err(Error::Unsupported("the LYWSD03MMC clock cannot be set"));
        }
        let payload = time_message::encode(time.timestamp() as u32, self.tz_offset());
        let peripheral = self.connect().await?;
        let result = self
            .write_characteristic(&peripheral, UUID_TIME, &payload)
            .await;
        self.disconnect_quietly().await;
        result
    }

    /// Read the temperature unit shown on the device display.
    pub async fn units(&mut self) -> Result<TemperatureUnit> {
        let peripheral = self.connect().await?;
        let result = self.read_units(&peripheral).await;
        self.disconnect_quietly().await;
        result
    }

    /// Set the temperature unit shown on the device display.
    pub async fn set_units(&mut self, units: TemperatureUnit) -> Result<()> {
        let code = self.model.encode_units(units);
        let peripheral = self.connect().await?;
        let result = self
            .write_characteristic(&peripheral, UUID_UNITS, &[code])
            .await;
        self.disconnect_quietly().await;
        result
    }

    /// Download the hourly min/max history stored on the device.
    ///
    /// The device streams records as notifications; the download finishes
    /// when the stream goes quiet for a full notification timeout, or, for
    /// the LYWSD03MMC, as soon as the record covering the previous hour has
    /// been seen. Duplicate notifications are collapsed by record index.
    /// This is slow: expect minutes for a full buffer.
    pub async fn history(&mut self) -> Result<Vec<HistoryRecord>> {
        let peripheral = self.connect().await?;
        let result = self.read_history(&peripheral).await;
        self.disconnect_quietly().await;
        result
    }

    /// Read the history cursor position.
    pub async fn history_index(&mut self) -> Result<u32> {
        let peripheral = self.connect().await?;
        let result = self.read_history_index(&peripheral).await;
        self.disconnect_quietly().await;
        result
    }

    /// Move the history cursor, so the next download starts from `index`.
    pub async fn set_history_index(&mut self, index: u32) -> Result<()> {
        let peripheral = self.connect().await?;
        let result = self
            .write_characteristic(&peripheral, UUID_RECORD_IDX, &index.to_le_bytes())
            .await;
        self.disconnect_quietly().await;
        result
    }

    /// Read the history record counts: total capacity and currently stored.
    pub async fn num_stored_entries(&mut self) -> Result<(u32, u32)> {
        let peripheral = self.connect().await?;
        let result = self.read_num_stored_entries(&peripheral).await;
        self.disconnect_quietly().await;
        result
    }

    /// Drop the connection to the device, if any.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(peripheral) = &self.peripheral {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Find the peripheral among the adapter's known devices, scanning for
    /// it if it has not been discovered yet.
    async fn find_peripheral(&mut self) -> Result<Peripheral> {
        let adapter = self.adapter().await?;
        if let Some(peripheral) = known_peripheral(&adapter, self.address).await? {
            return Ok(peripheral);
        }

        debug!("scanning for {}", self.address);
        adapter.start_scan(ScanFilter::default()).await?;
        let deadline = Instant::now() + self.notification_timeout;
        let found = loop {
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            if let Some(peripheral) = known_peripheral(&adapter, self.address).await? {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
        };
        if let Err(e) = adapter.stop_scan().await {
            warn!("failed to stop scanning: {e}");
        }
        found.ok_or(Error::DeviceNotFound { mac: self.address })
    }

    /// Connect to the device and discover its services.
    async fn connect(&mut self) -> Result<Peripheral> {
        let peripheral = match &self.peripheral {
            Some(peripheral) => peripheral.clone(),
            None => {
                let peripheral = self.find_peripheral().await?;
                self.peripheral = Some(peripheral.clone());
                peripheral
            }
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(peripheral);
        }

        debug!("connecting to {}", self.address);
        let mut retries = CONNECT_RETRIES;
        loop {
            match timeout(self.notification_timeout, peripheral.connect()).await {
                Ok(Ok(())) => break,
                Ok(Err(err)) if retries > 0 => {
                    debug!("connection attempt to {} failed: {err}", self.address);
                    retries -= 1;
                }
                Ok(Err(err)) => {
                    // Drop the half-open link so it cannot poison later attempts.
                    self.disconnect_quietly().await;
                    return Err(Error::Connect {
                        mac: self.address,
                        source: err,
                    });
                }
                Err(_) => {
                    self.disconnect_quietly().await;
                    return Err(Error::Timeout {
                        mac: self.address,
                        timeout: self.notification_timeout,
                    });
                }
            }
        }
        peripheral.discover_services().await?;
        Ok(peripheral)
    }

    async fn disconnect_quietly(&mut self) {
        if let Some(peripheral) = &self.peripheral {
            debug!("disconnecting from {}", self.address);
            if let Err(e) = peripheral.disconnect().await {
                warn!("while disconnecting from {}: {e}", self.address);
            }
        }
    }

    fn characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or(Error::CharacteristicNotFound(uuid))
    }

    async fn read_characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(peripheral, uuid)?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write_characteristic(
        &self,
        peripheral: &Peripheral,
        uuid: Uuid,
        payload: &[u8],
    ) -> Result<()> {
        let characteristic = self.characteristic(peripheral, uuid)?;
        Ok(peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?)
    }

    /// Subscribe to a characteristic and wait for a single notification.
    async fn notified_value(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(peripheral, uuid)?;
        peripheral.subscribe(&characteristic).await?;
        let mut notifications = peripheral.notifications().await?;
        let result = loop {
            match timeout(self.notification_timeout, notifications.next()).await {
                Err(_) => {
                    break Err(Error::Timeout {
                        mac: self.address,
                        timeout: self.notification_timeout,
                    })
                }
                Ok(None) => break Err(Error::StreamClosed { mac: self.address }),
                Ok(Some(notification)) if notification.uuid == uuid => {
                    break Ok(notification.value)
                }
                Ok(Some(_)) => {}
            }
        };
        if let Err(e) = peripheral.unsubscribe(&characteristic).await {
            debug!("failed to unsubscribe from {uuid}: {e}");
        }
        result
    }

    async fn read_sensor_data(&self, peripheral: &Peripheral) -> Result<SensorData> {
        let payload = self.notified_value(peripheral, UUID_DATA).await?;
        debug!(
            "sensor payload from {}: 0x{}",
            self.address,
            hex::encode(&payload)
        );
        sensor_message::decode(self.model, &payload)
    }

    async fn read_battery_level(&self, peripheral: &Peripheral) -> Result<f32> {
        let payload = self.read_characteristic(peripheral, UUID_BATTERY).await?;
        match payload.first() {
            Some(&level) => Ok(f32::from(level)),
            None => Err(Error::Payload {
                what: "battery",
                payload,
            }),
        }
    }

    async fn read_time(&self, peripheral: &Peripheral) -> Result<(DateTime<Local>, i8)> {
        let payload = self.read_characteristic(peripheral, UUID_TIME).await?;
        let (epoch, tz_offset) = time_message::decode(&payload)?;
        let time = DateTime::from(UNIX_EPOCH + Duration::from_secs(u64::from(epoch)));
        Ok((time, tz_offset))
    }

    async fn read_units(&self, peripheral: &Peripheral) -> Result<TemperatureUnit> {
        let payload = self.read_characteristic(peripheral, UUID_UNITS).await?;
        match payload.first() {
            Some(&code) => self.model.decode_units(code),
            None => Err(Error::Payload {
                what: "units",
                payload,
            }),
        }
    }

    /// When the LYWSD03MMC started up. Its time characteristic counts
    /// seconds since boot, so the start time dates its history records.
    async fn start_time(&mut self, peripheral: &Peripheral) -> Result<DateTime<Local>> {
        if let Some(start) = self.start_time {
            return Ok(start);
        }
        let payload = self.read_characteristic(peripheral, UUID_TIME).await?;
        let (uptime, _) = time_message::decode(&payload)?;
        let start = Local::now() - TimeDelta::seconds(i64::from(uptime));
        self.start_time = Some(start);
        Ok(start)
    }

    async fn read_history(&mut self, peripheral: &Peripheral) -> Result<Vec<HistoryRecord>> {
        let start_time = match self.model {
            Model::Lywsd02 => None,
            Model::Lywsd03 => Some(self.start_time(peripheral).await?),
        };
        // The record for the current hour only appears once the hour is
        // over, so the previous hour is the newest record to expect.
        let expected_end = Local::now() - TimeDelta::hours(1);

        let characteristic = self.characteristic(peripheral, UUID_HISTORY)?;
        peripheral.subscribe(&characteristic).await?;
        let mut notifications = peripheral.notifications().await?;

        let mut records: BTreeMap<u32, HistoryRecord> = BTreeMap::new();
        loop {
            match timeout(self.notification_timeout, notifications.next()).await {
                Err(_) => {
                    debug!("timeout listening to {}", self.address);
                    break;
                }
                Ok(None) => break,
                Ok(Some(notification)) if notification.uuid == UUID_HISTORY => {
                    let record = match history_message::decode(self.model, &notification.value) {
                        Ok(message) => message.into_record(start_time),
                        Err(e) => {
                            warn!("skipping history record from {}: {e}", self.address);
                            continue;
                        }
                    };
                    let time = record.time;
                    records.insert(record.index, record);
                    if self.model == Model::Lywsd03 && time >= expected_end {
                        break;
                    }
                }
                Ok(Some(_)) => {}
            }
        }
        if let Err(e) = peripheral.unsubscribe(&characteristic).await {
            debug!("failed to unsubscribe from {UUID_HISTORY}: {e}");
        }
        Ok(records.into_values().collect())
    }

    async fn read_history_index(&self, peripheral: &Peripheral) -> Result<u32> {
        let payload = self
            .read_characteristic(peripheral, UUID_RECORD_IDX)
            .await?;
        // An empty value means the cursor has never been set.
        if payload.is_empty() {
            return Ok(0);
        }
        if payload.len() < 4 {
            return Err(Error::Payload {
                what: "history index",
                payload,
            });
        }
        Ok(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    async fn read_num_stored_entries(&self, peripheral: &Peripheral) -> Result<(u32, u32)> {
        let payload = self
            .read_characteristic(peripheral, UUID_NUM_RECORDS)
            .await?;
        if payload.len() < 8 {
            return Err(Error::Payload {
                what: "record count",
                payload,
            });
        }
        let total = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let current = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Ok((total, current))
    }
}

async fn known_peripheral(adapter: &Adapter, address: BDAddr) -> Result<Option<Peripheral>> {
    Ok(adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|peripheral| peripheral.address() == address))
}
