use crate::bridge::NativeCode;

/// Result codes reported by the AFC primitives
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(C)]
pub enum AfcError {
    #[error("Unknown error")]
    UnknownError = 1,
    #[error("Operation header invalid")]
    OpHeaderInvalid = 2,
    #[error("No resources available")]
    NoResources = 3,
    #[error("Read error")]
    ReadError = 4,
    #[error("Write error")]
    WriteError = 5,
    #[error("Unknown packet type")]
    UnknownPacketType = 6,
    #[error("Invalid argument")]
    InvalidArg = 7,
    #[error("Object not found")]
    ObjectNotFound = 8,
    #[error("Object is a directory")]
    ObjectIsDir = 9,
    #[error("Permission denied")]
    PermDenied = 10,
    #[error("Service not connected")]
    ServiceNotConnected = 11,
    #[error("Operation timed out")]
    OpTimeout = 12,
    #[error("Too much data")]
    TooMuchData = 13,
    #[error("End of data")]
    EndOfData = 14,
    #[error("Operation not supported")]
    OpNotSupported = 15,
    #[error("Object already exists")]
    ObjectExists = 16,
    #[error("Object is busy")]
    ObjectBusy = 17,
    #[error("No space left")]
    NoSpaceLeft = 18,
    #[error("Operation would block")]
    OpWouldBlock = 19,
    #[error("I/O error")]
    IoError = 20,
    #[error("Operation interrupted")]
    OpInterrupted = 21,
    #[error("Operation in progress")]
    OpInProgress = 22,
    #[error("Internal error")]
    InternalError = 23,
    #[error("Multiplexer error")]
    MuxError = 30,
    #[error("Out of memory")]
    NoMem = 31,
    #[error("Not enough data")]
    NotEnoughData = 32,
    #[error("Directory not empty")]
    DirNotEmpty = 33,
}

impl From<NativeCode> for AfcError {
    fn from(code: NativeCode) -> Self {
        match code.0 {
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            _ => Self::UnknownError,
        }
    }
}
