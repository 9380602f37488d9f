//! Status and event registers
//!
//! Decodes the IEEE 488.2 status byte, the standard event status register and the
//! instrument's operation, questionable and measurement event registers into
//! named conditions. Each register is backed by one [`BitmaskDictionary`] built
//! from a fixed bit layout; layouts follow the published status model and are
//! never derived at runtime.

pub mod bitmask;

pub use bitmask::BitmaskDictionary;

use crate::error::TspResult;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::hash::Hash;

/// A named bit (or bit group) of one register.
pub trait RegisterBit: Copy + Eq + Hash + Debug + 'static {
    /// `(bit, mask, excluded_from_all)` in register order.
    const LAYOUT: &'static [(Self, u32, bool)];

    /// Short mnemonic used in logs and reports.
    fn mnemonic(self) -> &'static str;
}

/// Build the dictionary for a register layout.
pub fn dictionary<B: RegisterBit>() -> TspResult<BitmaskDictionary<B>> {
    let mut dict = BitmaskDictionary::new();
    for &(bit, mask, excluded) in B::LAYOUT {
        if excluded {
            dict.add_excluded(bit, mask)?;
        } else {
            dict.add(bit, mask)?;
        }
    }
    Ok(dict)
}

/// Status byte (serial poll / `*STB?`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusByteBit {
    /// `MSB`
    MeasurementSummary,
    /// `SSB`
    SystemSummary,
    /// `EAV`
    ErrorAvailable,
    /// `QSB`
    QuestionableSummary,
    /// `MAV`
    MessageAvailable,
    /// `ESB`
    StandardEventSummary,
    /// RQS/MSS. Not enableable, so it stays out of `All`.
    RequestingService,
    /// `OSB`
    OperationSummary,
}

impl RegisterBit for StatusByteBit {
    const LAYOUT: &'static [(Self, u32, bool)] = &[
        (Self::MeasurementSummary, 0x01, false),
        (Self::SystemSummary, 0x02, false),
        (Self::ErrorAvailable, 0x04, false),
        (Self::QuestionableSummary, 0x08, false),
        (Self::MessageAvailable, 0x10, false),
        (Self::StandardEventSummary, 0x20, false),
        (Self::RequestingService, 0x40, true),
        (Self::OperationSummary, 0x80, false),
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            Self::MeasurementSummary => "MSB",
            Self::SystemSummary => "SSB",
            Self::ErrorAvailable => "EAV",
            Self::QuestionableSummary => "QSB",
            Self::MessageAvailable => "MAV",
            Self::StandardEventSummary => "ESB",
            Self::RequestingService => "RQS",
            Self::OperationSummary => "OSB",
        }
    }
}

/// Standard event status register (`*ESR?`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardEventBit {
    /// `OPC`
    OperationComplete,
    /// `RQC`
    RequestControl,
    /// `QYE`
    QueryError,
    /// `DDE`
    DeviceDependentError,
    /// `EXE`
    ExecutionError,
    /// `CME`
    CommandError,
    /// `URQ`
    UserRequest,
    /// `PON`
    PowerOn,
}

impl RegisterBit for StandardEventBit {
    const LAYOUT: &'static [(Self, u32, bool)] = &[
        (Self::OperationComplete, 0x01, false),
        (Self::RequestControl, 0x02, false),
        (Self::QueryError, 0x04, false),
        (Self::DeviceDependentError, 0x08, false),
        (Self::ExecutionError, 0x10, false),
        (Self::CommandError, 0x20, false),
        (Self::UserRequest, 0x40, false),
        (Self::PowerOn, 0x80, false),
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            Self::OperationComplete => "OPC",
            Self::RequestControl => "RQC",
            Self::QueryError => "QYE",
            Self::DeviceDependentError => "DDE",
            Self::ExecutionError => "EXE",
            Self::CommandError => "CME",
            Self::UserRequest => "URQ",
            Self::PowerOn => "PON",
        }
    }
}

/// Operation event register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationEventBit {
    /// `CAL`
    Calibrating,
    /// `MEAS`
    Measuring,
    /// `REM`
    Remote,
    /// `USER`
    User,
    /// `INST`
    Instrument,
    /// `PROG`
    Program,
}

impl RegisterBit for OperationEventBit {
    const LAYOUT: &'static [(Self, u32, bool)] = &[
        (Self::Calibrating, 0x0001, false),
        (Self::Measuring, 0x0010, false),
        (Self::Remote, 0x0800, false),
        (Self::User, 0x1000, false),
        (Self::Instrument, 0x2000, false),
        (Self::Program, 0x4000, false),
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            Self::Calibrating => "CAL",
            Self::Measuring => "MEAS",
            Self::Remote => "REM",
            Self::User => "USER",
            Self::Instrument => "INST",
            Self::Program => "PROG",
        }
    }
}

/// Questionable event register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestionableEventBit {
    /// `CAL`
    Calibration,
    /// `UO`
    UnstableOutput,
    /// `OTEMP`
    OverTemperature,
    /// `INST`
    Instrument,
}

impl RegisterBit for QuestionableEventBit {
    const LAYOUT: &'static [(Self, u32, bool)] = &[
        (Self::Calibration, 0x0100, false),
        (Self::UnstableOutput, 0x0200, false),
        (Self::OverTemperature, 0x1000, false),
        (Self::Instrument, 0x2000, false),
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            Self::Calibration => "CAL",
            Self::UnstableOutput => "UO",
            Self::OverTemperature => "OTEMP",
            Self::Instrument => "INST",
        }
    }
}

/// Measurement event register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementEventBit {
    /// `VLMT`
    VoltageLimit,
    /// `ILMT`
    CurrentLimit,
    /// `ROF`
    ReadingOverflow,
    /// `BAV`
    BufferAvailable,
    /// `BFL`
    BufferFull,
    /// `INST`
    Instrument,
}

impl RegisterBit for MeasurementEventBit {
    const LAYOUT: &'static [(Self, u32, bool)] = &[
        (Self::VoltageLimit, 0x0001, false),
        (Self::CurrentLimit, 0x0002, false),
        (Self::ReadingOverflow, 0x0004, false),
        (Self::BufferAvailable, 0x0080, false),
        (Self::BufferFull, 0x0100, false),
        (Self::Instrument, 0x2000, false),
    ];

    fn mnemonic(self) -> &'static str {
        match self {
            Self::VoltageLimit => "VLMT",
            Self::CurrentLimit => "ILMT",
            Self::ReadingOverflow => "ROF",
            Self::BufferAvailable => "BAV",
            Self::BufferFull => "BFL",
            Self::Instrument => "INST",
        }
    }
}

/// The device-category event registers read with a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventRegister {
    /// Standard event register.
    Standard,
    /// Operation event register.
    Operation,
    /// Questionable event register.
    Questionable,
    /// Measurement event register.
    Measurement,
}

/// One decoded status byte sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusByte(pub u8);

impl StatusByte {
    /// Raw value widened for dictionary lookups.
    pub fn bits(self) -> u32 {
        u32::from(self.0)
    }

    fn has(self, bit: StatusByteBit) -> bool {
        StatusByteBit::LAYOUT
            .iter()
            .find(|(b, _, _)| *b == bit)
            .map(|(_, mask, _)| self.bits() & mask != 0)
            .unwrap_or(false)
    }

    /// EAV: the error queue is not empty.
    pub fn error_available(self) -> bool {
        self.has(StatusByteBit::ErrorAvailable)
    }

    /// MAV: a reply is waiting in the output queue.
    pub fn message_available(self) -> bool {
        self.has(StatusByteBit::MessageAvailable)
    }

    /// RQS/MSS.
    pub fn requesting_service(self) -> bool {
        self.has(StatusByteBit::RequestingService)
    }

    /// ESB.
    pub fn standard_event_summary(self) -> bool {
        self.has(StatusByteBit::StandardEventSummary)
    }

    /// Conditions that are on, in bit order.
    pub fn conditions(self) -> Vec<StatusByteBit> {
        StatusByteBit::LAYOUT
            .iter()
            .filter(|(_, mask, _)| self.bits() & mask != 0)
            .map(|(bit, _, _)| *bit)
            .collect()
    }
}

impl fmt::Display for StatusByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.conditions().into_iter().map(|b| b.mnemonic()).collect();
        write!(f, "0x{:02X} [{}]", self.0, names.join(","))
    }
}

/// The full set of register dictionaries for one connection.
///
/// Every dictionary's cached status is the last value sampled on that
/// connection. The owning session updates it on each poll or register read.
#[derive(Debug, Clone)]
pub struct StatusRegisters {
    /// Status byte (serial poll) bits.
    pub status_byte: BitmaskDictionary<StatusByteBit>,
    /// IEEE-488.2 standard event register.
    pub standard_event: BitmaskDictionary<StandardEventBit>,
    /// Operation event register.
    pub operation_event: BitmaskDictionary<OperationEventBit>,
    /// Questionable event register.
    pub questionable_event: BitmaskDictionary<QuestionableEventBit>,
    /// Measurement event register.
    pub measurement_event: BitmaskDictionary<MeasurementEventBit>,
}

impl StatusRegisters {
    /// Build all dictionaries from their fixed layouts.
    pub fn new() -> TspResult<Self> {
        Ok(Self {
            status_byte: dictionary()?,
            standard_event: dictionary()?,
            operation_event: dictionary()?,
            questionable_event: dictionary()?,
            measurement_event: dictionary()?,
        })
    }

    /// Store a fresh status byte sample and return it decoded.
    pub fn record_status_byte(&mut self, raw: u8) -> StatusByte {
        self.status_byte.set_status(u32::from(raw));
        StatusByte(raw)
    }

    /// Store a fresh event register value.
    pub fn record_event(&mut self, register: EventRegister, value: u32) {
        match register {
            EventRegister::Standard => self.standard_event.set_status(value),
            EventRegister::Operation => self.operation_event.set_status(value),
            EventRegister::Questionable => self.questionable_event.set_status(value),
            EventRegister::Measurement => self.measurement_event.set_status(value),
        }
    }

    /// Last recorded value of an event register.
    pub fn event_status(&self, register: EventRegister) -> u32 {
        match register {
            EventRegister::Standard => self.standard_event.status(),
            EventRegister::Operation => self.operation_event.status(),
            EventRegister::Questionable => self.questionable_event.status(),
            EventRegister::Measurement => self.measurement_event.status(),
        }
    }

    /// Mnemonics of the conditions that are on in `value` for `register`.
    pub fn describe_event(&self, register: EventRegister, value: u32) -> Vec<&'static str> {
        fn names<B: RegisterBit>(dict: &BitmaskDictionary<B>, value: u32) -> Vec<&'static str> {
            dict.active_keys(value).into_iter().map(B::mnemonic).collect()
        }
        match register {
            EventRegister::Standard => names(&self.standard_event, value),
            EventRegister::Operation => names(&self.operation_event, value),
            EventRegister::Questionable => names(&self.questionable_event, value),
            EventRegister::Measurement => names(&self.measurement_event, value),
        }
    }
}
