use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::errors::IdError;

/// 2020-01-01T00:00:00Z in milliseconds since the unix epoch.
pub const ID_EPOCH_MS: u64 = 1_577_836_800_000;

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIMESTAMP_BITS: u32 = 64 - 1 - MACHINE_BITS - SEQUENCE_BITS;

pub const MAX_MACHINE_ID: u16 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// How far the clock may step backwards before generation refuses to continue.
const MAX_BACKWARDS_DRIFT_MS: u64 = 5_000;

/// How long an exhausted sequence waits for the clock to tick over.
const MAX_TICK_WAIT: Duration = Duration::from_secs(1);

/// The identity of this process within the cluster.
///
/// Two instances sharing the same metadata store must never run with the
/// same machine identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MachineIdentity(u16);

impl MachineIdentity {
    pub fn new(id: u16) -> Result<Self, IdError> {
        if id > MAX_MACHINE_ID {
            return Err(IdError::InvalidMachineId(id));
        }

        Ok(Self(id))
    }

    #[inline]
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for MachineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster unique, roughly time ordered identifier.
///
/// Layout from the most significant bit: 1 unused bit, 41 bits of
/// milliseconds since [`ID_EPOCH_MS`], 10 bits of machine identity
/// and 12 bits of sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniqueId(u64);

impl UniqueId {
    fn compose(timestamp: u64, machine: MachineIdentity, sequence: u16) -> Self {
        Self(
            (timestamp << (MACHINE_BITS + SEQUENCE_BITS))
                | ((machine.get() as u64) << SEQUENCE_BITS)
                | sequence as u64,
        )
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds since [`ID_EPOCH_MS`].
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.0 >> (MACHINE_BITS + SEQUENCE_BITS)
    }

    #[inline]
    pub fn machine(&self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & MAX_MACHINE_ID as u64) as u16
    }

    #[inline]
    pub fn sequence(&self) -> u16 {
        (self.0 & MAX_SEQUENCE as u64) as u16
    }

    /// A url safe textual form used for media ids.
    pub fn to_media_id(&self) -> String {
        base64::encode_config(self.0.to_be_bytes(), base64::URL_SAFE_NO_PAD)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source of wall clock time in milliseconds since the unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct GeneratorState {
    last_timestamp: u64,
    sequence: u16,
}

/// Produces [`UniqueId`]s for a single machine identity.
#[derive(Clone)]
pub struct IdGenerator {
    machine: MachineIdentity,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<GeneratorState>>,
}

impl IdGenerator {
    pub fn new(machine: MachineIdentity) -> Self {
        Self::with_clock(machine, Arc::new(SystemClock))
    }

    pub fn with_clock(machine: MachineIdentity, clock: Arc<dyn Clock>) -> Self {
        Self {
            machine,
            clock,
            state: Arc::new(Mutex::new(GeneratorState::default())),
        }
    }

    #[inline]
    pub fn machine_id(&self) -> MachineIdentity {
        self.machine
    }

    fn elapsed_since_epoch(&self) -> Result<u64, IdError> {
        let now = self.clock.now_millis();
        if now < ID_EPOCH_MS {
            return Err(IdError::ClockBeforeEpoch);
        }

        Ok(now - ID_EPOCH_MS)
    }

    /// Generates a new id.
    ///
    /// When the sequence for the current millisecond is exhausted this
    /// waits for the clock to reach the next millisecond, giving up with
    /// [`IdError::ClockStalled`] if it does not within [`MAX_TICK_WAIT`].
    pub fn new_unique_id(&self) -> Result<UniqueId, IdError> {
        let mut state = self.state.lock().map_err(|_| IdError::Poisoned)?;

        let mut now = self.elapsed_since_epoch()?;
        if now < state.last_timestamp {
            let drift = state.last_timestamp - now;
            if drift > MAX_BACKWARDS_DRIFT_MS {
                return Err(IdError::ClockMovedBackwards(drift));
            }
            now = state.last_timestamp;
        }

        if now == state.last_timestamp {
            if state.sequence == MAX_SEQUENCE {
                let deadline = Instant::now() + MAX_TICK_WAIT;
                while now <= state.last_timestamp {
                    if Instant::now() >= deadline {
                        return Err(IdError::ClockStalled(MAX_TICK_WAIT.as_millis() as u64));
                    }

                    std::thread::sleep(Duration::from_micros(100));
                    now = self.elapsed_since_epoch()?;
                    if state.last_timestamp.saturating_sub(now) > MAX_BACKWARDS_DRIFT_MS {
                        return Err(IdError::ClockMovedBackwards(state.last_timestamp - now));
                    }
                }
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }

        if now > MAX_TIMESTAMP {
            return Err(IdError::TimestampOverflow);
        }

        state.last_timestamp = now;
        Ok(UniqueId::compose(now, self.machine, state.sequence))
    }
}
