use std::io;

use thiserror::Error;

/// Failure while reading a Valve shortcuts file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VdfError {
    #[error("expected byte 0x{expected:02x} at offset {offset}, found 0x{found:02x}")]
    UnexpectedByte { offset: usize, expected: u8, found: u8 },
    #[error("unknown entry tag 0x{tag:02x} at offset {offset}")]
    UnknownTag { offset: usize, tag: u8 },
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid UTF-8 string at offset {0}")]
    InvalidString(usize),
}

/// Failure while parsing a LEGO Data Dictionary (`boot.cfg`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LddError {
    #[error("entry `{0}` is missing `=`")]
    MissingEquals(String),
    #[error("entry `{0}` is missing `:`")]
    MissingType(String),
    #[error("entry `{entry}` has unknown type code `{code}`")]
    UnknownType { entry: String, code: String },
    #[error("entry `{entry}` has an invalid value for type {code}")]
    InvalidValue { entry: String, code: u8 },
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch {0} is not compatible with this client")]
    Incompatible(String),
    #[error("patch {patch} conflicts with installed patch {other}")]
    Conflict { patch: String, other: String },
    #[error("latest version of {0} is not known yet")]
    VersionUnknown(String),
    #[error("patch {0} does not support this operation")]
    Unsupported(String),
    #[error("patch archive {0} is already added")]
    AlreadyExists(String),
    #[error("patch archive {archive} is invalid: {reason}")]
    InvalidArchive { archive: String, reason: String },
    #[error("client requirement not met: {0}")]
    RequirementNotMet(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no installed runtime is available")]
    NotInstalled,
    #[error("runtime {0} cannot be installed automatically")]
    ManualInstall(String),
    #[error("runtime {0} is not supported on this system")]
    Unsupported(String),
    #[error("runtime install cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("another operation is already in progress")]
    OperationInProgress,
    #[error("operation not valid while launcher is {0}")]
    InvalidState(String),
    #[error("{0}")]
    Patch(#[from] PatchError),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a filesystem failure, shown next to failure states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoHint {
    PermissionDenied,
    NotEnoughSpace,
    NotFound,
    InUse,
    Other,
}

impl IoHint {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied
            }
            io::ErrorKind::StorageFull => Self::NotEnoughSpace,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::ResourceBusy | io::ErrorKind::ExecutableFileBusy => Self::InUse,
            _ => Self::Other,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::PermissionDenied => "PermissionDenied",
            Self::NotEnoughSpace => "NotEnoughSpace",
            Self::NotFound => "NotFound",
            Self::InUse => "FileInUse",
            Self::Other => "ExceptionWhileExtracting",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_error_kind() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(IoHint::classify(&denied), IoHint::PermissionDenied);
        let full = io::Error::from(io::ErrorKind::StorageFull);
        assert_eq!(IoHint::classify(&full).tag(), "NotEnoughSpace");
        let other = io::Error::other("boom");
        assert_eq!(IoHint::classify(&other).tag(), "ExceptionWhileExtracting");
    }
}
