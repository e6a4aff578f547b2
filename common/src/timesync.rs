use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    connectivity::NetError, events::AppEvent, state_machine::PolledStateMachine, timer::Timer,
};

pub const NTP_PACKET_SIZE: usize = 48;
pub const NTP_PORT: u16 = 123;
/// Seconds between 1900-01-01 and 1970-01-01.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub const REQUEST_SETTLE_MS: u32 = 1_000;
pub const RESPONSE_WINDOW_MS: u32 = 1_000;
pub const RESYNC_INTERVAL_MS: u32 = 10 * 60 * 1_000;
pub const RETRY_INTERVAL_MS: u32 = 10_000;

const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const VERSION: u8 = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NtpError {
    #[error("short packet ({0} bytes)")]
    Short(usize),
    #[error("unexpected mode {0}")]
    Mode(u8),
    #[error("server not synchronized (stratum 0)")]
    Unsynchronized,
    #[error("zero transmit timestamp")]
    ZeroTimestamp,
}

pub trait NtpTransport: Send {
    fn send(&mut self, request: &[u8; NTP_PACKET_SIZE]) -> Result<(), NetError>;
    /// Next pending datagram, if any, without blocking.
    fn try_recv(&mut self, buf: &mut [u8; NTP_PACKET_SIZE]) -> Option<usize>;
}

pub trait RealTimeClock: Send {
    fn set_time(&mut self, now: DateTime<Utc>);
}

pub fn build_request() -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0; NTP_PACKET_SIZE];
    packet[0] = (VERSION << 3) | MODE_CLIENT;
    packet
}

pub fn parse_response(packet: &[u8]) -> Result<DateTime<Utc>, NtpError> {
    if packet.len() < NTP_PACKET_SIZE {
        return Err(NtpError::Short(packet.len()));
    }
    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(NtpError::Mode(mode));
    }
    if packet[1] == 0 {
        return Err(NtpError::Unsynchronized);
    }
    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    if seconds == 0 && fraction == 0 {
        return Err(NtpError::ZeroTimestamp);
    }

    // Era 1 starts in 2036 when the 32-bit seconds field wraps.
    let mut ntp_seconds = u64::from(seconds);
    if ntp_seconds < NTP_UNIX_OFFSET {
        ntp_seconds += 1 << 32;
    }
    let unix = (ntp_seconds - NTP_UNIX_OFFSET) as i64;
    let nanos = ((u64::from(fraction) * 1_000_000_000) >> 32) as u32;
    DateTime::from_timestamp(unix, nanos).ok_or(NtpError::ZeroTimestamp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    WaitForNetwork,
    Start,
    WaitForResponse,
    Done,
}

pub struct TimeSyncClient<T, C> {
    transport: T,
    clock: C,
    machine: PolledStateMachine<SyncState>,
    timer: Timer,
    next_sync: Timer,
    received: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
}

impl<T: NtpTransport, C: RealTimeClock> TimeSyncClient<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            machine: PolledStateMachine::new(SyncState::WaitForNetwork),
            timer: Timer::expired(),
            next_sync: Timer::expired(),
            received: None,
            last_sync: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.machine.state()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn poll(&mut self, now_ms: u32, network_available: bool) -> Option<AppEvent> {
        if !network_available
            && matches!(
                self.machine.state(),
                SyncState::Start | SyncState::WaitForResponse
            )
        {
            debug!("network lost during time sync");
            self.machine.change_state(SyncState::WaitForNetwork);
            return None;
        }

        match self.machine.state() {
            SyncState::WaitForNetwork => {
                if network_available {
                    self.machine.change_state(SyncState::Start);
                }
                None
            }
            SyncState::Start => {
                if self.machine.is_first_time() {
                    self.received = None;
                    if let Err(err) = self.transport.send(&build_request()) {
                        warn!("time request failed: {err}; retrying in {RETRY_INTERVAL_MS} ms");
                        self.schedule(now_ms, RETRY_INTERVAL_MS);
                        return None;
                    }
                    self.timer.arm(now_ms, REQUEST_SETTLE_MS);
                }
                if self.timer.is_expired(now_ms) {
                    self.machine.change_state(SyncState::WaitForResponse);
                }
                None
            }
            SyncState::WaitForResponse => self.wait_for_response(now_ms),
            SyncState::Done => {
                if self.next_sync.is_expired(now_ms) {
                    self.machine.change_state(SyncState::WaitForNetwork);
                }
                None
            }
        }
    }

    fn wait_for_response(&mut self, now_ms: u32) -> Option<AppEvent> {
        if self.machine.is_first_time() {
            self.timer.arm(now_ms, RESPONSE_WINDOW_MS);
        }

        let mut buf = [0; NTP_PACKET_SIZE];
        while let Some(len) = self.transport.try_recv(&mut buf) {
            match parse_response(&buf[..len.min(NTP_PACKET_SIZE)]) {
                Ok(time) => self.received = Some(time),
                Err(err) => warn!("ignoring time response: {err}"),
            }
        }

        if let Some(time) = self.received.take() {
            self.clock.set_time(time);
            self.last_sync = Some(time);
            info!("clock set to {}", time.to_rfc3339());
            self.schedule(now_ms, RESYNC_INTERVAL_MS);
            return Some(AppEvent::TimeSynced { at: time });
        }

        if self.timer.is_expired(now_ms) {
            warn!("no valid time response; retrying in {RETRY_INTERVAL_MS} ms");
            self.schedule(now_ms, RETRY_INTERVAL_MS);
        }
        None
    }

    fn schedule(&mut self, now_ms: u32, delay_ms: u32) {
        self.next_sync.arm(now_ms, delay_ms);
        self.machine.change_state(SyncState::Done);
    }
}
