//! One connected balance board.
//!
//! A session moves `Connecting -> Connected -> Disconnected` and never back.
//! While connected, a receive task owns the report channel and is the only
//! writer of the board's readings; everybody else reads the last known values.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jiff::Timestamp;
use tare_core::calibration::Calibration;
use tare_core::mass::MassReading;
use tare_core::protocol::{
    CALIBRATION_LEN, CALIBRATION_LOCATION, Event, MAX_FRAME_LEN, REPORT_BALANCE, SENSOR_COUNT,
    build_read, build_set_light, build_set_report_mode, parse_frame,
};
use tare_core::{BoardAddress, BoardDetails, BoardStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::transport::{Channel, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection to {address} failed: {source}")]
    Connect {
        address: BoardAddress,
        #[source]
        source: TransportError,
    },

    #[error("session for {0} was already started")]
    AlreadyStarted(BoardAddress),

    #[error("board {0} is not connected")]
    NotConnected(BoardAddress),

    #[error("sending to {address} failed: {source}")]
    Send {
        address: BoardAddress,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Switch the board's power light on once connected.
    pub light_on_connect: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            light_on_connect: true,
        }
    }
}

/// What the receive loop has to send back after applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reaction {
    Nothing,
    ResumeReporting,
}

#[derive(Debug)]
struct BoardState {
    status: BoardStatus,
    calibration: Calibration,
    sensors: [u16; SENSOR_COUNT],
    mass: [f64; SENSOR_COUNT],
    total_mass: f64,
    battery: Option<u8>,
    faulted: bool,
    connected_at: Option<Timestamp>,
    last_report_at: Option<Timestamp>,
}

impl BoardState {
    fn new() -> Self {
        Self {
            status: BoardStatus::Connecting,
            calibration: Calibration::new(),
            sensors: [0; SENSOR_COUNT],
            mass: [0.0; SENSOR_COUNT],
            total_mass: 0.0,
            battery: None,
            faulted: false,
            connected_at: None,
            last_report_at: None,
        }
    }

    /// Move to `to` unless the session already ended. Returns whether the
    /// status changed.
    fn transition(&mut self, to: BoardStatus) -> bool {
        if self.status == BoardStatus::Disconnected || self.status == to {
            return false;
        }
        self.status = to;
        true
    }

    fn apply(&mut self, event: Event) -> Reaction {
        match event {
            Event::Status {
                buttons,
                flags,
                battery,
            } => {
                debug!(buttons, flags, battery, "status report");
                self.battery = Some(battery);
                return Reaction::ResumeReporting;
            }
            Event::Buttons { buttons } => {
                debug!(buttons, "button report");
            }
            Event::CalibrationChunk(chunk) => {
                if chunk.error != 0 {
                    warn!(
                        error = chunk.error,
                        chunk_address = chunk.address,
                        "read acknowledgement reported an error"
                    );
                    return Reaction::Nothing;
                }

                let was_complete = self.calibration.is_complete();
                match self.calibration.apply_chunk(chunk.address, chunk.payload()) {
                    Ok(()) => {
                        debug!(received = self.calibration.received(), "calibration chunk");
                        if !was_complete && self.calibration.is_complete() {
                            info!("Calibration complete");
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring read acknowledgement"),
                }
            }
            Event::Report { sensors } => {
                self.sensors = sensors;
                self.last_report_at = Some(Timestamp::now());

                let Some(points) = self.calibration.points() else {
                    trace!("report before calibration completed");
                    return Reaction::Nothing;
                };

                let reading = MassReading::compute(&sensors, &points);
                if reading.is_faulted() {
                    if !self.faulted {
                        for fault in reading.faults.iter().flatten() {
                            warn!(error = %fault, "axis calibration unusable, reporting zero");
                        }
                    }
                    self.faulted = true;
                } else {
                    self.faulted = false;
                }

                self.mass = reading.axes;
                self.total_mass = reading.total;
            }
            Event::Unknown { type_byte } => {
                warn!(type_byte = format_args!("{type_byte:#04x}"), "unknown packet type");
            }
        }

        Reaction::Nothing
    }
}

fn read_state(state: &RwLock<BoardState>) -> RwLockReadGuard<'_, BoardState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &RwLock<BoardState>) -> RwLockWriteGuard<'_, BoardState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

struct Link<C> {
    control: Arc<C>,
    report: Arc<C>,
    receiver: JoinHandle<()>,
}

pub struct BoardSession<C: Channel> {
    address: BoardAddress,
    settings: SessionSettings,
    state: Arc<RwLock<BoardState>>,
    link: Mutex<Option<Link<C>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl<C: Channel> fmt::Debug for BoardSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardSession")
            .field("address", &self.address)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<C: Channel> BoardSession<C> {
    /// A session in the `Connecting` state. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(address: BoardAddress, settings: SessionSettings) -> Self {
        Self {
            address,
            settings,
            state: Arc::new(RwLock::new(BoardState::new())),
            link: Mutex::new(None),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn address(&self) -> &BoardAddress {
        &self.address
    }

    pub fn status(&self) -> BoardStatus {
        read_state(&self.state).status
    }

    /// Last computed total mass in kilograms.
    pub fn total_mass(&self) -> f64 {
        read_state(&self.state).total_mass
    }

    pub fn is_calibrated(&self) -> bool {
        read_state(&self.state).calibration.is_complete()
    }

    pub fn details(&self) -> BoardDetails {
        let state = read_state(&self.state);
        BoardDetails {
            address: self.address.clone(),
            status: state.status,
            calibrated: state.calibration.is_complete(),
            calibration_received: state.calibration.received(),
            sensors: state.sensors,
            mass: state.mass,
            total_mass: state.total_mass,
            battery: state.battery,
            connected_at: state.connected_at,
            last_report_at: state.last_report_at,
        }
    }

    /// Open both channels, start the receive task, then ask the board for its
    /// calibration block and for continuous reports.
    ///
    /// Only the first call does anything; a failed connect leaves the session
    /// `Disconnected`.
    pub async fn connect<T>(&self, transport: &T) -> Result<(), SessionError>
    where
        T: Transport<Channel = C>,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted(self.address.clone()));
        }

        let control = {
            let mut link = self.link.lock().await;

            let pair = match transport.connect(&self.address).await {
                Ok(pair) => pair,
                Err(source) => {
                    write_state(&self.state).transition(BoardStatus::Disconnected);
                    return Err(SessionError::Connect {
                        address: self.address.clone(),
                        source,
                    });
                }
            };

            // disconnect() raced us while the channels were opening
            if self.cancel.is_cancelled() {
                if let Err(e) = pair.control.close().await {
                    warn!(address = %self.address, error = %e, "Could not close control channel");
                }
                if let Err(e) = pair.report.close().await {
                    warn!(address = %self.address, error = %e, "Could not close report channel");
                }
                write_state(&self.state).transition(BoardStatus::Disconnected);
                return Err(SessionError::NotConnected(self.address.clone()));
            }

            {
                let mut state = write_state(&self.state);
                state.transition(BoardStatus::Connected);
                state.connected_at = Some(Timestamp::now());
            }
            info!(address = %self.address, "Connected to board");

            let control = Arc::new(pair.control);
            let report = Arc::new(pair.report);
            let receiver = tokio::spawn(run_receive_loop(
                self.address.clone(),
                Arc::clone(&self.state),
                Arc::clone(&control),
                Arc::clone(&report),
                self.cancel.clone(),
            ));

            *link = Some(Link {
                control: Arc::clone(&control),
                report,
                receiver,
            });
            control
        };

        if let Err(source) = self.initialise(control.as_ref()).await {
            warn!(address = %self.address, error = %source, "Board setup failed");
            self.disconnect().await;
            return Err(SessionError::Send {
                address: self.address.clone(),
                source,
            });
        }

        Ok(())
    }

    async fn initialise(&self, control: &C) -> Result<(), TransportError> {
        control
            .send(&build_read(CALIBRATION_LOCATION, CALIBRATION_LEN as u16))
            .await?;
        control
            .send(&build_set_report_mode(true, REPORT_BALANCE))
            .await?;
        if self.settings.light_on_connect {
            control.send(&build_set_light(true)).await?;
        }
        Ok(())
    }

    /// Send a raw command frame on the control channel.
    pub async fn send(&self, frame: &[u8]) -> Result<(), SessionError> {
        let control = self
            .link
            .lock()
            .await
            .as_ref()
            .filter(|_| self.status() == BoardStatus::Connected)
            .map(|link| Arc::clone(&link.control))
            .ok_or_else(|| SessionError::NotConnected(self.address.clone()))?;

        control
            .send(frame)
            .await
            .map_err(|source| SessionError::Send {
                address: self.address.clone(),
                source,
            })
    }

    pub async fn set_light(&self, on: bool) -> Result<(), SessionError> {
        self.send(&build_set_light(on)).await
    }

    /// Mark the session ended, stop the receive task and wait for it, then
    /// close both channels.
    ///
    /// Safe to call any number of times from any number of tasks; the
    /// teardown itself runs once.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        write_state(&self.state).transition(BoardStatus::Disconnected);

        let link = self.link.lock().await.take();
        let Some(link) = link else {
            return;
        };

        if let Err(e) = link.receiver.await {
            warn!(address = %self.address, error = %e, "Receive task panicked");
        }
        if let Err(e) = link.control.close().await {
            warn!(address = %self.address, error = %e, "Could not close control channel");
        }
        if let Err(e) = link.report.close().await {
            warn!(address = %self.address, error = %e, "Could not close report channel");
        }

        info!(address = %self.address, "Disconnected board");
    }
}

#[instrument(name = "receive_loop", skip_all, fields(address = %address))]
async fn run_receive_loop<C: Channel>(
    address: BoardAddress,
    state: Arc<RwLock<BoardState>>,
    control: Arc<C>,
    report: Arc<C>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_FRAME_LEN];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("receive loop cancelled");
                break;
            }
            read = report.recv(&mut buf) => match read {
                Ok(0) => {
                    info!("Board closed the report channel");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Report channel read failed");
                    break;
                }
            }
        };

        let event = match parse_frame(&buf[..n]) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };

        let reaction = write_state(&state).apply(event);
        if reaction == Reaction::ResumeReporting {
            if let Err(e) = control
                .send(&build_set_report_mode(true, REPORT_BALANCE))
                .await
            {
                warn!(error = %e, "failed to resume continuous reporting");
            }
        }
    }

    write_state(&state).transition(BoardStatus::Disconnected);
}
