//! Status codes and error handling.
//!
//! Every operation answers the client with a numeric status code in the
//! response frame; `StatusCode` is the complete table the engine can emit.
//! `XtrieveError` is the internal error type; it always collapses to a
//! status code at the dispatch boundary, so the transport never sees a
//! failure shape the client cannot interpret.

use std::fmt;

use thiserror::Error;

/// Wire status codes.
///
/// The numbers are part of the protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    /// Operation completed successfully.
    Success = 0,
    /// Operation code not recognized, or not valid in this state.
    InvalidOperation = 1,
    /// I/O error reading or writing the file.
    Io = 2,
    /// Position block does not identify an open file.
    FileNotOpen = 3,
    /// No record with the requested key value.
    KeyNotFound = 4,
    /// Insert/Update would duplicate a key that forbids duplicates.
    DuplicateKey = 5,
    /// Key number outside the file's declared keys.
    InvalidKeyNumber = 6,
    /// Key number differs from the one the cursor was established on.
    DifferentKeyNumber = 7,
    /// Operation requires a positioned cursor and there is none.
    InvalidPositioning = 8,
    /// Walked past the last (or first) record.
    EndOfFile = 9,
    /// Update changed a key whose descriptor is not modifiable.
    ModifiableKeyChanged = 10,
    /// Named file does not exist.
    FileNotFound = 12,
    /// Medium rejected growth.
    DiskFull = 18,
    /// Structural inconsistency; the file is unhealthy until reopened.
    Internal = 20,
    /// Caller's data buffer is smaller than the record.
    DataBufferTooShort = 22,
    /// Page size not one of 512/1024/2048/4096.
    PageSizeError = 24,
    /// Record length of zero or beyond what a page can hold.
    InvalidRecordLength = 28,
    /// Key count or key descriptor out of range.
    InvalidKeySpec = 29,
    /// Begin while a transaction is already active.
    TransactionActive = 36,
    /// End/Abort without an active transaction.
    NoTransaction = 37,
    /// Commit or abort failed mid-way.
    TransactionAbort = 38,
    /// Too many files touched by one transaction.
    TransactionLimit = 39,
    /// This session was chosen as the deadlock victim.
    Deadlock = 78,
    /// Record held by another session.
    RecordLocked = 84,
    /// File held (opened exclusively) by another session.
    FileLocked = 85,
    /// Exclusive open of a file that is already open.
    FileAlreadyOpen = 88,
    /// Write attempted through a read-only handle.
    Permission = 94,
}

impl StatusCode {
    /// Raw wire value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Decodes a wire value, if it is one this engine emits.
    #[must_use]
    pub const fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::InvalidOperation),
            2 => Some(Self::Io),
            3 => Some(Self::FileNotOpen),
            4 => Some(Self::KeyNotFound),
            5 => Some(Self::DuplicateKey),
            6 => Some(Self::InvalidKeyNumber),
            7 => Some(Self::DifferentKeyNumber),
            8 => Some(Self::InvalidPositioning),
            9 => Some(Self::EndOfFile),
            10 => Some(Self::ModifiableKeyChanged),
            12 => Some(Self::FileNotFound),
            18 => Some(Self::DiskFull),
            20 => Some(Self::Internal),
            22 => Some(Self::DataBufferTooShort),
            24 => Some(Self::PageSizeError),
            28 => Some(Self::InvalidRecordLength),
            29 => Some(Self::InvalidKeySpec),
            36 => Some(Self::TransactionActive),
            37 => Some(Self::NoTransaction),
            38 => Some(Self::TransactionAbort),
            39 => Some(Self::TransactionLimit),
            78 => Some(Self::Deadlock),
            84 => Some(Self::RecordLocked),
            85 => Some(Self::FileLocked),
            88 => Some(Self::FileAlreadyOpen),
            94 => Some(Self::Permission),
            _ => None,
        }
    }

    /// True for status 0.
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Contention statuses the caller may retry after backing off.
    #[inline]
    #[must_use]
    pub const fn is_contention(self) -> bool {
        matches!(self, Self::RecordLocked | Self::FileLocked | Self::Deadlock)
    }

    /// Short human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InvalidOperation => "invalid operation",
            Self::Io => "I/O error",
            Self::FileNotOpen => "file not open",
            Self::KeyNotFound => "key not found",
            Self::DuplicateKey => "duplicate key",
            Self::InvalidKeyNumber => "invalid key number",
            Self::DifferentKeyNumber => "different key number",
            Self::InvalidPositioning => "invalid positioning",
            Self::EndOfFile => "end of file",
            Self::ModifiableKeyChanged => "modifiable key changed",
            Self::FileNotFound => "file not found",
            Self::DiskFull => "disk full",
            Self::Internal => "internal error",
            Self::DataBufferTooShort => "data buffer too short",
            Self::PageSizeError => "page size error",
            Self::InvalidRecordLength => "invalid record length",
            Self::InvalidKeySpec => "invalid key specification",
            Self::TransactionActive => "transaction already active",
            Self::NoTransaction => "no active transaction",
            Self::TransactionAbort => "transaction abort error",
            Self::TransactionLimit => "transaction file limit",
            Self::Deadlock => "deadlock detected",
            Self::RecordLocked => "record locked",
            Self::FileLocked => "file locked",
            Self::FileAlreadyOpen => "file already open",
            Self::Permission => "permission error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.label())
    }
}

/// Engine-internal error type.
///
/// Library code propagates this with `?`; the dispatcher converts it to a
/// `StatusCode` for the wire. `Status` is the common case: an expected
/// outcome with a precise wire number. `Io` and `Corrupt` carry context for
/// the log before collapsing to statuses 2 and 20.
#[derive(Debug, Error)]
pub enum XtrieveError {
    /// An outcome with a direct wire representation.
    #[error("status {0}")]
    Status(StatusCode),

    /// Underlying file I/O failed.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A page or header failed validation.
    #[error("corrupt file: {detail}")]
    Corrupt { detail: String },
}

impl XtrieveError {
    /// Shorthand for a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// The wire status this error collapses to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status(code) => *code,
            Self::Io { source } if source.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::FileNotFound
            }
            Self::Io { source } if source.kind() == std::io::ErrorKind::StorageFull => {
                StatusCode::DiskFull
            }
            Self::Io { source } if source.kind() == std::io::ErrorKind::PermissionDenied => {
                StatusCode::Permission
            }
            Self::Io { .. } => StatusCode::Io,
            Self::Corrupt { .. } => StatusCode::Internal,
        }
    }
}

impl From<StatusCode> for XtrieveError {
    fn from(code: StatusCode) -> Self {
        Self::Status(code)
    }
}

/// Result alias used across the workspace.
pub type XtrieveResult<T> = Result<T, XtrieveError>;
