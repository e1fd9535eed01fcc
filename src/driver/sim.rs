//! In-process driver producing synthetic Mono8 frames
//!
//! Behaves like a free-running camera engine: each opened camera gets a
//! delivery thread once acquisition starts, which fills the oldest pending
//! buffer at a fixed interval and hands it to the completion callback on
//! that thread. In manual mode nothing is delivered until
//! [`SimDriver::deliver_next`] is called, which runs the callback on the
//! caller's thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BufferDescriptor, DeviceHandle, Driver, DriverError, FrameCallback, Rejected};
use crate::capture::frame::{Frame, PixelFormat, ReceiveStatus};

const ACQUISITION_MODES: &[&str] = &["Continuous", "SingleFrame", "MultiFrame"];
const TRIGGER_SOURCES: &[&str] = &["Freerun", "Software", "FixedRate", "Line1", "Line2"];
const PIXEL_FORMATS: &[&str] = &["Mono8"];
const COMMANDS: &[&str] = &["AcquisitionStart", "AcquisitionStop", "GVSPAdjustPacketSize"];
const SYSTEM_COMMANDS: &[&str] = &["GeVDiscoveryAllOnce"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Deliver from per-camera threads; otherwise only through `deliver_next`
    pub free_run: bool,
    pub frame_interval_ms: u64,
    pub sensor_width: u32,
    pub sensor_height: u32,
    /// Width and height are rounded down to a multiple of this
    pub size_increment: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            free_run: true,
            frame_interval_ms: 33,
            sensor_width: 640,
            sensor_height: 480,
            size_increment: 8,
        }
    }
}

impl SimulatorConfig {
    pub fn manual() -> Self {
        Self {
            free_run: false,
            ..Self::default()
        }
    }

    pub fn free_running(interval: Duration) -> Self {
        Self {
            free_run: true,
            frame_interval_ms: interval.as_millis().max(1) as u64,
            ..Self::default()
        }
    }
}

/// What the simulator has done with one camera's buffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub announced: u64,
    pub queued: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub flushed: u64,
    pub revoked: u64,
    /// Delivery ticks that found no pending buffer
    pub starved: u64,
}

/// A submitted buffer together with its completion handler
pub type PendingFrame = (Frame, Arc<dyn FrameCallback>);

struct Sensor {
    max_width: u32,
    max_height: u32,
    width: u32,
    height: u32,
    acquisition_mode: String,
    trigger_source: String,
    pixel_format: String,
    statuses: VecDeque<ReceiveStatus>,
    payload_override: Option<i64>,
    failing_feature: Option<String>,
    next_frame_id: u64,
    counters: SimCounters,
    handle: Option<DeviceHandle>,
}

impl Sensor {
    fn new(width: u32, height: u32) -> Self {
        Self {
            max_width: width,
            max_height: height,
            width,
            height,
            acquisition_mode: "SingleFrame".into(),
            trigger_source: "Software".into(),
            pixel_format: "Mono8".into(),
            statuses: VecDeque::new(),
            payload_override: None,
            failing_feature: None,
            next_frame_id: 0,
            counters: SimCounters::default(),
            handle: None,
        }
    }

    fn payload_size(&self) -> i64 {
        self.payload_override
            .unwrap_or(self.width as i64 * self.height as i64)
    }

    fn check_access(&self, call: &'static str, feature: &str) -> Result<(), DriverError> {
        match &self.failing_feature {
            Some(failing) if failing == feature => Err(DriverError::Vendor { call, code: -4 }),
            _ => Ok(()),
        }
    }

    /// Write the next synthetic image into `frame`
    fn fill(&mut self, frame: &mut Frame, epoch: Instant) {
        self.next_frame_id += 1;
        let frame_id = self.next_frame_id;
        let status = self.statuses.pop_front().unwrap_or(ReceiveStatus::Complete);

        let payload = (self.payload_size().max(0) as usize).min(frame.capacity());
        frame.buffer_mut()[..payload].fill(frame_id as u8);

        frame.meta.receive_status = status;
        frame.meta.image_size = match status {
            ReceiveStatus::Complete => payload as u32,
            _ => (payload / 2) as u32,
        };
        frame.meta.width = self.width;
        frame.meta.height = self.height;
        frame.meta.pixel_format = PixelFormat::Mono8;
        frame.meta.frame_id = frame_id;
        frame.meta.timestamp = epoch.elapsed().as_nanos() as u64;
        self.counters.delivered += 1;
    }
}

struct Session {
    id: String,
    announced: Vec<BufferDescriptor>,
    engine_running: bool,
    acquiring: bool,
    pending: VecDeque<PendingFrame>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SimState {
    started: bool,
    next_handle: u64,
    sensors: HashMap<String, Sensor>,
    sessions: HashMap<DeviceHandle, Session>,
}

impl SimState {
    fn camera(&mut self, handle: DeviceHandle) -> Result<(&mut Session, &mut Sensor), DriverError> {
        if !self.started {
            return Err(DriverError::NotStarted);
        }
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(DriverError::BadHandle(handle))?;
        let sensor = self
            .sensors
            .get_mut(&session.id)
            .ok_or(DriverError::BadHandle(handle))?;
        Ok((session, sensor))
    }

    fn handle_of(&self, id: &str) -> Result<DeviceHandle, DriverError> {
        self.sensors
            .get(id)
            .and_then(|sensor| sensor.handle)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))
    }
}

struct Shared {
    state: Mutex<SimState>,
    config: SimulatorConfig,
    epoch: Instant,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Simulated capture engine
pub struct SimDriver {
    shared: Arc<Shared>,
}

impl SimDriver {
    pub fn new(config: SimulatorConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    next_handle: 100,
                    ..SimState::default()
                }),
                config,
                epoch: Instant::now(),
            }),
        })
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.shared.config
    }

    /// Register a camera with the default sensor size
    pub fn add_default_camera(&self, id: &str) {
        let (width, height) = (self.shared.config.sensor_width, self.shared.config.sensor_height);
        self.add_camera(id, width, height);
    }

    pub fn add_camera(&self, id: &str, width: u32, height: u32) {
        self.shared
            .lock()
            .sensors
            .insert(id.to_string(), Sensor::new(width, height));
    }

    /// Receive statuses for the next deliveries, oldest first
    pub fn script_statuses(&self, id: &str, statuses: impl IntoIterator<Item = ReceiveStatus>) {
        if let Some(sensor) = self.shared.lock().sensors.get_mut(id) {
            sensor.statuses.extend(statuses);
        }
    }

    /// Report this `PayloadSize` regardless of the negotiated format
    pub fn override_payload(&self, id: &str, payload: Option<i64>) {
        if let Some(sensor) = self.shared.lock().sensors.get_mut(id) {
            sensor.payload_override = payload;
        }
    }

    /// Make every access to `feature` fail
    pub fn fail_feature(&self, id: &str, feature: &str) {
        if let Some(sensor) = self.shared.lock().sensors.get_mut(id) {
            sensor.failing_feature = Some(feature.to_string());
        }
    }

    pub fn counters(&self, id: &str) -> SimCounters {
        self.shared
            .lock()
            .sensors
            .get(id)
            .map(|sensor| sensor.counters)
            .unwrap_or_default()
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock().started
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.shared.lock().handle_of(id).is_ok()
    }

    pub fn pending_len(&self, id: &str) -> usize {
        let state = self.shared.lock();
        state
            .handle_of(id)
            .ok()
            .and_then(|handle| state.sessions.get(&handle))
            .map_or(0, |session| session.pending.len())
    }

    /// Fill the oldest pending buffer and run its callback on this thread.
    ///
    /// Returns false when nothing is pending.
    pub fn deliver_next(&self, id: &str) -> Result<bool, DriverError> {
        let (handle, frame, callback) = {
            let mut state = self.shared.lock();
            let handle = state.handle_of(id)?;
            let (session, sensor) = state.camera(handle)?;
            if !session.acquiring {
                return Err(DriverError::NotCapturing);
            }
            let Some((mut frame, callback)) = session.pending.pop_front() else {
                return Ok(false);
            };
            sensor.fill(&mut frame, self.shared.epoch);
            (handle, frame, callback)
        };

        callback.frame_done(handle, frame);
        Ok(true)
    }

    /// Pull the oldest pending buffer out unfilled, as if a transfer were
    /// still in progress
    pub fn take_pending(&self, id: &str) -> Option<PendingFrame> {
        let mut state = self.shared.lock();
        let handle = state.handle_of(id).ok()?;
        state.sessions.get_mut(&handle)?.pending.pop_front()
    }

    /// Stop a camera's delivery thread, waiting for an in-flight callback
    fn stop_worker(&self, worker: Option<JoinHandle<()>>) {
        let Some(worker) = worker else { return };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("Simulated delivery thread panicked");
        }
    }

    fn spawn_worker(&self, handle: DeviceHandle, id: &str) -> Result<JoinHandle<()>, DriverError> {
        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("sim-{id}"))
            .spawn(move || run_worker(shared, handle))
            .map_err(|_| DriverError::Vendor {
                call: "run_command",
                code: -1,
            })
    }
}

fn run_worker(shared: Arc<Shared>, handle: DeviceHandle) {
    let interval = Duration::from_millis(shared.config.frame_interval_ms);
    loop {
        thread::sleep(interval);

        let (frame, callback) = {
            let mut state = shared.lock();
            let Ok((session, sensor)) = state.camera(handle) else {
                break;
            };
            if !session.acquiring {
                break;
            }
            let Some((mut frame, callback)) = session.pending.pop_front() else {
                sensor.counters.starved += 1;
                continue;
            };
            sensor.fill(&mut frame, shared.epoch);
            (frame, callback)
        };

        callback.frame_done(handle, frame);
    }
    debug!(%handle, "Simulated delivery thread exiting");
}

impl Driver for SimDriver {
    fn startup(&self) -> Result<(), DriverError> {
        self.shared.lock().started = true;
        info!("Simulated driver started");
        Ok(())
    }

    fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let mut state = self.shared.lock();
            state.started = false;
            for sensor in state.sensors.values_mut() {
                sensor.handle = None;
            }
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        for mut session in sessions {
            self.stop_worker(session.worker.take());
        }
        info!("Simulated driver shut down");
    }

    fn open_camera(&self, id: &str) -> Result<DeviceHandle, DriverError> {
        let mut state = self.shared.lock();
        if !state.started {
            return Err(DriverError::NotStarted);
        }
        let handle = DeviceHandle(state.next_handle);
        let sensor = state
            .sensors
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        if sensor.handle.is_some() {
            return Err(DriverError::AlreadyOpen(id.to_string()));
        }
        sensor.handle = Some(handle);
        state.next_handle += 1;
        state.sessions.insert(
            handle,
            Session {
                id: id.to_string(),
                announced: Vec::new(),
                engine_running: false,
                acquiring: false,
                pending: VecDeque::new(),
                worker: None,
            },
        );
        Ok(handle)
    }

    fn close_camera(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        let mut session = {
            let mut state = self.shared.lock();
            state.camera(handle)?.1.handle = None;
            state
                .sessions
                .remove(&handle)
                .ok_or(DriverError::BadHandle(handle))?
        };
        session.acquiring = false;
        self.stop_worker(session.worker.take());
        Ok(())
    }

    fn run_command(&self, handle: DeviceHandle, name: &str) -> Result<(), DriverError> {
        if handle == DeviceHandle::SYSTEM {
            let state = self.shared.lock();
            if !state.started {
                return Err(DriverError::NotStarted);
            }
            if !SYSTEM_COMMANDS.contains(&name) {
                return Err(DriverError::UnknownFeature(name.to_string()));
            }
            return Ok(());
        }

        let worker = {
            let mut state = self.shared.lock();
            let (session, sensor) = state.camera(handle)?;
            sensor.check_access("run_command", name)?;
            if !COMMANDS.contains(&name) {
                return Err(DriverError::UnknownFeature(name.to_string()));
            }
            match name {
                "AcquisitionStart" => {
                    if !session.engine_running {
                        return Err(DriverError::NotCapturing);
                    }
                    session.acquiring = true;
                    if self.shared.config.free_run && session.worker.is_none() {
                        let id = session.id.clone();
                        session.worker = Some(self.spawn_worker(handle, &id)?);
                    }
                    None
                }
                "AcquisitionStop" => {
                    session.acquiring = false;
                    session.worker.take()
                }
                _ => None,
            }
        };

        self.stop_worker(worker);
        Ok(())
    }

    fn get_int(&self, handle: DeviceHandle, name: &str) -> Result<i64, DriverError> {
        let mut state = self.shared.lock();
        let (_, sensor) = state.camera(handle)?;
        sensor.check_access("get_int", name)?;
        match name {
            "Width" => Ok(sensor.width as i64),
            "Height" => Ok(sensor.height as i64),
            "WidthMax" => Ok(sensor.max_width as i64),
            "HeightMax" => Ok(sensor.max_height as i64),
            "PayloadSize" => Ok(sensor.payload_size()),
            _ => Err(DriverError::UnknownFeature(name.to_string())),
        }
    }

    fn set_int(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<(), DriverError> {
        let increment = self.shared.config.size_increment.max(1) as i64;
        let mut state = self.shared.lock();
        let (session, sensor) = state.camera(handle)?;
        sensor.check_access("set_int", name)?;
        if session.acquiring {
            return Err(DriverError::Vendor {
                call: "set_int",
                code: -6,
            });
        }

        let negotiate = |max: u32| -> u32 {
            let clamped = value.clamp(increment, max as i64);
            (clamped - clamped % increment) as u32
        };
        match name {
            "Width" => sensor.width = negotiate(sensor.max_width),
            "Height" => sensor.height = negotiate(sensor.max_height),
            _ => return Err(DriverError::UnknownFeature(name.to_string())),
        }
        Ok(())
    }

    fn get_enum(&self, handle: DeviceHandle, name: &str) -> Result<String, DriverError> {
        let mut state = self.shared.lock();
        let (_, sensor) = state.camera(handle)?;
        sensor.check_access("get_enum", name)?;
        match name {
            "AcquisitionMode" => Ok(sensor.acquisition_mode.clone()),
            "TriggerSource" => Ok(sensor.trigger_source.clone()),
            "PixelFormat" => Ok(sensor.pixel_format.clone()),
            _ => Err(DriverError::UnknownFeature(name.to_string())),
        }
    }

    fn set_enum(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        let (_, sensor) = state.camera(handle)?;
        sensor.check_access("set_enum", name)?;

        let (allowed, slot): (&[&str], &mut String) = match name {
            "AcquisitionMode" => (ACQUISITION_MODES, &mut sensor.acquisition_mode),
            "TriggerSource" => (TRIGGER_SOURCES, &mut sensor.trigger_source),
            "PixelFormat" => (PIXEL_FORMATS, &mut sensor.pixel_format),
            _ => return Err(DriverError::UnknownFeature(name.to_string())),
        };
        if !allowed.contains(&value) {
            return Err(DriverError::InvalidValue {
                feature: name.to_string(),
                value: value.to_string(),
            });
        }
        *slot = value.to_string();
        Ok(())
    }

    fn announce_frame(
        &self,
        handle: DeviceHandle,
        buffer: BufferDescriptor,
    ) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        let (session, sensor) = state.camera(handle)?;
        if (buffer.capacity as i64) < sensor.payload_size() {
            return Err(DriverError::Vendor {
                call: "announce_frame",
                code: -2,
            });
        }
        session.announced.retain(|known| known.slot != buffer.slot);
        session.announced.push(buffer);
        sensor.counters.announced += 1;
        Ok(())
    }

    fn revoke_all_frames(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        let (session, sensor) = state.camera(handle)?;
        if !session.pending.is_empty() {
            return Err(DriverError::BuffersInUse);
        }
        sensor.counters.revoked += session.announced.len() as u64;
        session.announced.clear();
        Ok(())
    }

    fn capture_start(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        let (session, _) = state.camera(handle)?;
        session.engine_running = true;
        Ok(())
    }

    fn capture_end(&self, handle: DeviceHandle) -> Result<(), DriverError> {
        let worker = {
            let mut state = self.shared.lock();
            let (session, _) = state.camera(handle)?;
            session.engine_running = false;
            session.acquiring = false;
            session.worker.take()
        };
        self.stop_worker(worker);
        Ok(())
    }

    fn queue_frame(
        &self,
        handle: DeviceHandle,
        frame: Frame,
        callback: Arc<dyn FrameCallback>,
    ) -> Result<(), Rejected> {
        let mut state = self.shared.lock();
        let (session, sensor) = match state.camera(handle) {
            Ok(camera) => camera,
            Err(error) => return Err(Rejected { frame, error }),
        };

        let error = if !session.engine_running {
            Some(DriverError::NotCapturing)
        } else if !session
            .announced
            .iter()
            .any(|known| known.slot == frame.slot() && known.capacity <= frame.capacity())
        {
            Some(DriverError::NotAnnounced(frame.slot()))
        } else {
            None
        };

        if let Some(error) = error {
            sensor.counters.rejected += 1;
            return Err(Rejected { frame, error });
        }

        session.pending.push_back((frame, callback));
        sensor.counters.queued += 1;
        Ok(())
    }

    fn queue_flush(&self, handle: DeviceHandle) -> Result<Vec<Frame>, DriverError> {
        let mut state = self.shared.lock();
        let (session, sensor) = state.camera(handle)?;
        let frames: Vec<Frame> = session.pending.drain(..).map(|(frame, _)| frame).collect();
        sensor.counters.flushed += frames.len() as u64;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(config: SimulatorConfig) -> (Arc<SimDriver>, DeviceHandle) {
        let driver = SimDriver::new(config);
        driver.add_camera("cam", 100, 60);
        driver.startup().unwrap();
        let handle = driver.open_camera("cam").unwrap();
        (driver, handle)
    }

    #[test]
    fn negotiates_requested_size() {
        let (driver, handle) = opened(SimulatorConfig::manual());
        driver.set_int(handle, "Width", 93).unwrap();
        driver.set_int(handle, "Height", 1000).unwrap();
        assert_eq!(driver.get_int(handle, "Width").unwrap(), 88);
        assert_eq!(driver.get_int(handle, "Height").unwrap(), 56);
        assert_eq!(driver.get_int(handle, "PayloadSize").unwrap(), 88 * 56);
    }

    #[test]
    fn validates_enum_features() {
        let (driver, handle) = opened(SimulatorConfig::manual());
        driver.set_enum(handle, "TriggerSource", "Freerun").unwrap();
        assert_eq!(driver.get_enum(handle, "TriggerSource").unwrap(), "Freerun");
        assert!(matches!(
            driver.set_enum(handle, "PixelFormat", "Rgb8"),
            Err(DriverError::InvalidValue { .. })
        ));
        assert!(matches!(
            driver.set_enum(handle, "Gain", "High"),
            Err(DriverError::UnknownFeature(_))
        ));
    }

    #[test]
    fn camera_opens_once() {
        let (driver, handle) = opened(SimulatorConfig::manual());
        assert!(matches!(
            driver.open_camera("cam"),
            Err(DriverError::AlreadyOpen(_))
        ));
        assert!(matches!(
            driver.open_camera("missing"),
            Err(DriverError::NotFound(_))
        ));
        driver.close_camera(handle).unwrap();
        assert!(!driver.is_open("cam"));
        assert!(driver.open_camera("cam").is_ok());
    }

    #[test]
    fn requires_startup() {
        let driver = SimDriver::new(SimulatorConfig::manual());
        driver.add_camera("cam", 8, 8);
        assert!(matches!(
            driver.open_camera("cam"),
            Err(DriverError::NotStarted)
        ));
        assert!(matches!(
            driver.run_command(DeviceHandle::SYSTEM, "GeVDiscoveryAllOnce"),
            Err(DriverError::NotStarted)
        ));
    }

    #[test]
    fn acquisition_needs_running_engine() {
        let (driver, handle) = opened(SimulatorConfig::manual());
        assert!(matches!(
            driver.run_command(handle, "AcquisitionStart"),
            Err(DriverError::NotCapturing)
        ));
        driver.capture_start(handle).unwrap();
        driver.run_command(handle, "AcquisitionStart").unwrap();
        assert!(!driver.deliver_next("cam").unwrap());
    }

    #[test]
    fn failing_feature_is_reported() {
        let (driver, handle) = opened(SimulatorConfig::manual());
        driver.fail_feature("cam", "AcquisitionMode");
        assert!(matches!(
            driver.set_enum(handle, "AcquisitionMode", "Continuous"),
            Err(DriverError::Vendor { code: -4, .. })
        ));
    }
}
