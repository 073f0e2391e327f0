//! In-process transport for running without hardware.
//!
//! Every connection is a pair of bounded queues. In simulated mode a task per
//! connection plays the board side of the protocol; in manual mode the board
//! side is handed to the caller, which is how the tests script frames.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tare_core::BoardAddress;
use tare_core::calibration::{AxisPoints, CalibrationPoints};
use tare_core::mass::HALF_LOAD;
use tare_core::protocol::{
    CALIBRATION_BASE, CALIBRATION_LEN, CALIBRATION_LOCATION, INPUT, LIGHT_ON, MAX_CHUNK_LEN,
    READ_MEMORY, READ_RETURN, REPORT_BALANCE, REPORT_CONTINUOUS, SENSOR_COUNT, SET_LIGHT,
    SET_REPORT_MODE, STATUS,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument};

use super::{Channel, ChannelPair, Transport, TransportError};

const CHANNEL_DEPTH: usize = 64;
const REPORT_PERIOD: Duration = Duration::from_millis(10);
/// Error nibble the board sets when a read targets unmapped memory.
const READ_ERROR_UNMAPPED: u8 = 0x08;

/// Calibration of a typical board, four sensors at 0, 17 and 34 kg.
pub const DEFAULT_CALIBRATION: CalibrationPoints = CalibrationPoints {
    axes: [
        AxisPoints { zero: 4_750, half: 6_480, full: 8_220 },
        AxisPoints { zero: 16_210, half: 17_960, full: 19_700 },
        AxisPoints { zero: 1_530, half: 3_280, full: 5_030 },
        AxisPoints { zero: 3_970, half: 5_700, full: 7_450 },
    ],
};

pub struct MockChannel {
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl MockChannel {
    fn sender(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            outbound: Mutex::new(Some(tx)),
            inbound: Mutex::new(None),
        }
    }

    fn receiver(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            outbound: Mutex::new(None),
            inbound: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(TransportError::Closed)?;

        tx.send(frame.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(TransportError::Closed)?;

        match rx.recv().await {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.outbound.lock().await.take();
        self.inbound.lock().await.take();
        Ok(())
    }
}

/// The board side of a mock connection.
pub struct DeviceEnd {
    pub address: BoardAddress,
    /// Frames the host wrote to its control channel.
    pub commands: mpsc::Receiver<Vec<u8>>,
    /// Frames delivered to the host's report channel.
    pub reports: mpsc::Sender<Vec<u8>>,
}

impl DeviceEnd {
    pub async fn next_command(&mut self) -> Option<Vec<u8>> {
        self.commands.recv().await
    }

    /// Deliver a frame to the host. Returns `false` once the host is gone.
    pub async fn push(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.reports.send(frame.into()).await.is_ok()
    }
}

enum Backend {
    Simulated(HashMap<BoardAddress, SimulatedBoard>),
    Manual(mpsc::UnboundedSender<DeviceEnd>),
}

pub struct MockTransport {
    backend: Backend,
    refused: HashSet<BoardAddress>,
    connects: AtomicUsize,
}

impl MockTransport {
    /// Boards answered by a protocol simulator. Connecting to any other
    /// address is refused.
    pub fn simulated(boards: impl IntoIterator<Item = SimulatedBoard>) -> Self {
        let boards = boards
            .into_iter()
            .map(|board| (board.address.clone(), board))
            .collect();

        Self {
            backend: Backend::Simulated(boards),
            refused: HashSet::new(),
            connects: AtomicUsize::new(0),
        }
    }

    /// Every connection yields a [`DeviceEnd`] on the returned receiver.
    pub fn manual() -> (Self, mpsc::UnboundedReceiver<DeviceEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            backend: Backend::Manual(tx),
            refused: HashSet::new(),
            connects: AtomicUsize::new(0),
        };
        (transport, rx)
    }

    /// Refuse connections to `address`.
    pub fn refuse(mut self, address: impl Into<BoardAddress>) -> Self {
        self.refused.insert(address.into());
        self
    }

    /// Number of connection attempts made so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

fn refused(address: &BoardAddress) -> TransportError {
    TransportError::Connect {
        address: address.clone(),
        channel: "control",
        source: io::Error::new(io::ErrorKind::ConnectionRefused, "board not reachable"),
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Channel = MockChannel;

    async fn connect(
        &self,
        address: &BoardAddress,
    ) -> Result<ChannelPair<MockChannel>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if self.refused.contains(address) {
            return Err(refused(address));
        }

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (report_tx, report_rx) = mpsc::channel(CHANNEL_DEPTH);
        let end = DeviceEnd {
            address: address.clone(),
            commands: command_rx,
            reports: report_tx,
        };

        match &self.backend {
            Backend::Simulated(boards) => {
                let board = boards.get(address).cloned().ok_or_else(|| refused(address))?;
                tokio::spawn(run_simulator(board, end));
            }
            Backend::Manual(ends) => {
                ends.send(end).map_err(|_| refused(address))?;
            }
        }

        Ok(ChannelPair {
            control: MockChannel::sender(command_tx),
            report: MockChannel::receiver(report_rx),
        })
    }
}

/// A board standing still under a constant load.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    pub address: BoardAddress,
    pub calibration: CalibrationPoints,
    /// Load on each sensor in kilograms.
    pub load: [f64; SENSOR_COUNT],
    pub battery: u8,
    /// Maximum noise, in raw counts, added to every reading.
    pub jitter: u16,
}

impl SimulatedBoard {
    pub fn new(address: impl Into<BoardAddress>, load: [f64; SENSOR_COUNT]) -> Self {
        Self {
            address: address.into(),
            calibration: DEFAULT_CALIBRATION,
            load,
            battery: 0xC0,
            jitter: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: u16) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_battery(mut self, battery: u8) -> Self {
        self.battery = battery;
        self
    }

    fn raw_reading(&self) -> [u16; SENSOR_COUNT] {
        let jitter = i32::from(self.jitter);
        std::array::from_fn(|i| {
            let raw = raw_point(self.calibration.axes[i], self.load[i]);
            if jitter == 0 {
                return raw;
            }
            let noise = rand::rng().random_range(-jitter..=jitter);
            (i32::from(raw) + noise).clamp(0, i32::from(u16::MAX)) as u16
        })
    }
}

/// Raw sensor value that maps back to `load` kilograms.
fn raw_point(points: AxisPoints, load: f64) -> u16 {
    let AxisPoints { zero, half, full } = points;
    let raw = if load <= 0.0 {
        f64::from(zero)
    } else if load < HALF_LOAD {
        f64::from(zero) + load / HALF_LOAD * (f64::from(half) - f64::from(zero))
    } else {
        f64::from(half) + (load - HALF_LOAD) / HALF_LOAD * (f64::from(full) - f64::from(half))
    };
    raw.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

pub fn status_frame(battery: u8) -> Vec<u8> {
    // flags 0x02: extension attached
    vec![INPUT, STATUS, 0x00, 0x00, 0x02, 0x00, 0x00, battery]
}

pub fn report_frame(sensors: [u16; SENSOR_COUNT]) -> Vec<u8> {
    let mut frame = vec![INPUT, REPORT_BALANCE, 0x00, 0x00];
    for sensor in sensors {
        frame.extend_from_slice(&sensor.to_be_bytes());
    }
    frame
}

/// Read acknowledgement carrying `data` (1..=16 bytes), padded to full size.
pub fn read_ack_frame(address: u16, data: &[u8], error: u8) -> Vec<u8> {
    let size = (data.len().clamp(1, MAX_CHUNK_LEN) - 1) as u8;
    let mut frame = vec![INPUT, READ_RETURN, 0x00, 0x00, (size << 4) | (error & 0x0F)];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&data[..data.len().min(MAX_CHUNK_LEN)]);
    frame.resize(7 + MAX_CHUNK_LEN, 0);
    frame
}

fn read_replies(memory: &[u8; CALIBRATION_LEN], location: [u8; 4], length: u16) -> Vec<Vec<u8>> {
    let address = u16::from_be_bytes([location[2], location[3]]);
    let length = usize::from(length);

    let Some(offset) = address
        .checked_sub(CALIBRATION_BASE)
        .map(usize::from)
        .filter(|offset| {
            location[..2] == CALIBRATION_LOCATION[..2]
                && length > 0
                && offset + length <= CALIBRATION_LEN
        })
    else {
        return vec![read_ack_frame(address, &[0], READ_ERROR_UNMAPPED)];
    };

    memory[offset..offset + length]
        .chunks(MAX_CHUNK_LEN)
        .enumerate()
        .map(|(i, chunk)| read_ack_frame(address + (i * MAX_CHUNK_LEN) as u16, chunk, 0))
        .collect()
}

#[instrument(name = "simulator", skip_all, fields(address = %board.address))]
async fn run_simulator(board: SimulatedBoard, mut end: DeviceEnd) {
    info!("Simulated board connected");

    let memory = board.calibration.to_bytes();
    let mut reporting = false;
    let mut ticker = tokio::time::interval(REPORT_PERIOD);

    if !end.push(status_frame(board.battery)).await {
        return;
    }

    loop {
        tokio::select! {
            command = end.commands.recv() => {
                let Some(command) = command else {
                    break;
                };

                match command.get(1).copied() {
                    Some(READ_MEMORY) if command.len() >= 8 => {
                        let location = [command[2], command[3], command[4], command[5]];
                        let length = u16::from_be_bytes([command[6], command[7]]);
                        for reply in read_replies(&memory, location, length) {
                            if !end.push(reply).await {
                                return;
                            }
                        }
                    }
                    Some(SET_REPORT_MODE) if command.len() >= 4 => {
                        reporting =
                            command[2] & REPORT_CONTINUOUS != 0 && command[3] == REPORT_BALANCE;
                        debug!(reporting, "report mode changed");
                    }
                    Some(SET_LIGHT) => {
                        debug!(on = command.get(2) == Some(&LIGHT_ON), "light toggled");
                    }
                    other => debug!(?other, "ignoring command"),
                }
            }
            _ = ticker.tick(), if reporting => {
                if !end.push(report_frame(board.raw_reading())).await {
                    break;
                }
            }
        }
    }

    info!("Simulated board closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tare_core::calibration::Calibration;
    use tare_core::mass::MassReading;
    use tare_core::protocol::{Event, build_read, build_set_report_mode, parse_frame};

    #[test]
    fn raw_points_invert_the_mass_curve() {
        let board = SimulatedBoard::new("AA", [0.0, 8.5, 17.0, 30.0]);
        let reading = MassReading::compute(&board.raw_reading(), &board.calibration);

        let expected = [0.0, 8.5, 17.0, 30.0];
        for (got, want) in reading.axes.iter().zip(expected) {
            assert!((got - want).abs() < 0.02, "{got} vs {want}");
        }
    }

    #[test]
    fn calibration_read_splits_into_chunks() {
        let memory = DEFAULT_CALIBRATION.to_bytes();
        let replies = read_replies(&memory, CALIBRATION_LOCATION, CALIBRATION_LEN as u16);
        assert_eq!(replies.len(), 2);

        let mut cal = Calibration::new();
        for reply in &replies {
            let Event::CalibrationChunk(chunk) = parse_frame(reply).unwrap() else {
                panic!("expected chunk");
            };
            assert_eq!(chunk.error, 0);
            cal.apply_chunk(chunk.address, chunk.payload()).unwrap();
        }
        assert_eq!(cal.points(), Some(DEFAULT_CALIBRATION));
    }

    #[test]
    fn unmapped_read_reports_error() {
        let memory = DEFAULT_CALIBRATION.to_bytes();
        let replies = read_replies(&memory, [0x04, 0xA2, 0x00, 0x00], 4);
        let Event::CalibrationChunk(chunk) = parse_frame(&replies[0]).unwrap() else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.error, READ_ERROR_UNMAPPED);
    }

    #[tokio::test]
    async fn simulator_streams_after_report_mode() {
        let transport = MockTransport::simulated([SimulatedBoard::new("AA", [10.0; 4])]);
        let pair = transport.connect(&"AA".into()).await.unwrap();
        let mut buf = [0u8; 32];

        let n = pair.report.recv(&mut buf).await.unwrap();
        assert!(matches!(parse_frame(&buf[..n]), Ok(Event::Status { .. })));

        pair.control
            .send(&build_read(CALIBRATION_LOCATION, CALIBRATION_LEN as u16))
            .await
            .unwrap();
        pair.control
            .send(&build_set_report_mode(true, REPORT_BALANCE))
            .await
            .unwrap();

        let mut chunks = 0;
        let mut reports = 0;
        while reports < 3 {
            let n = pair.report.recv(&mut buf).await.unwrap();
            match parse_frame(&buf[..n]).unwrap() {
                Event::CalibrationChunk(_) => chunks += 1,
                Event::Report { .. } => reports += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(chunks, 2);

        pair.control.close().await.unwrap();
        // simulator exits and the report side drains to end-of-stream
        loop {
            if pair.report.recv(&mut buf).await.unwrap() == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn unknown_and_refused_addresses_fail() {
        let transport =
            MockTransport::simulated([SimulatedBoard::new("AA", [0.0; 4])]).refuse("AA");
        assert!(transport.connect(&"AA".into()).await.is_err());
        assert!(transport.connect(&"BB".into()).await.is_err());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn closed_channel_rejects_io() {
        let (transport, _ends) = MockTransport::manual();
        let pair = transport.connect(&"AA".into()).await.unwrap();

        pair.control.close().await.unwrap();
        pair.control.close().await.unwrap();
        assert!(matches!(
            pair.control.send(&[0xA2]).await,
            Err(TransportError::Closed)
        ));

        pair.report.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            pair.report.recv(&mut buf).await,
            Err(TransportError::Closed)
        ));
    }
}
