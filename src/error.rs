use {crate::deferred::Broken, std::fmt};

///
/// Canonical failure returned by every operation, whatever backend served it.
///
/// Backend-specific error types never cross the [`crate::Client`] surface: adapters implement
/// [`Translate`] for their native vocabulary and the core converts at the boundary.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid key")]
    InvalidKey,
    #[error("no entry")]
    NoEntry,
    #[error("entry exists")]
    EntryExists,
    #[error("version mismatch")]
    VersionMismatch,
    #[error("connection loss")]
    ConnectionLoss,
    #[error("service error: {0}")]
    ServiceError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidAddress,
    InvalidKey,
    NoEntry,
    EntryExists,
    VersionMismatch,
    ConnectionLoss,
    ServiceError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidAddress => "InvalidAddress",
            Self::InvalidKey => "InvalidKey",
            Self::NoEntry => "NoEntry",
            Self::EntryExists => "EntryExists",
            Self::VersionMismatch => "VersionMismatch",
            Self::ConnectionLoss => "ConnectionLoss",
            Self::ServiceError => "ServiceError",
        };
        f.write_str(s)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAddress => ErrorKind::InvalidAddress,
            Self::InvalidKey => ErrorKind::InvalidKey,
            Self::NoEntry => ErrorKind::NoEntry,
            Self::EntryExists => ErrorKind::EntryExists,
            Self::VersionMismatch => ErrorKind::VersionMismatch,
            Self::ConnectionLoss => ErrorKind::ConnectionLoss,
            Self::ServiceError(_) => ErrorKind::ServiceError,
        }
    }

    ///
    /// Builds the canonical error for `kind`.
    ///
    /// The diagnostic is kept only for [`ErrorKind::ServiceError`], every other kind is self-describing.
    ///
    pub fn from_kind(kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        match kind {
            ErrorKind::InvalidAddress => Self::InvalidAddress,
            ErrorKind::InvalidKey => Self::InvalidKey,
            ErrorKind::NoEntry => Self::NoEntry,
            ErrorKind::EntryExists => Self::EntryExists,
            ErrorKind::VersionMismatch => Self::VersionMismatch,
            ErrorKind::ConnectionLoss => Self::ConnectionLoss,
            ErrorKind::ServiceError => Self::ServiceError(diagnostic.into()),
        }
    }
}

impl From<Broken> for Error {
    fn from(broken: Broken) -> Self {
        match broken {
            Broken::Abandoned => Self::ConnectionLoss,
            Broken::Panicked(msg) => Self::ServiceError(msg),
        }
    }
}

///
/// Translator from a backend-native failure to the canonical vocabulary.
///
/// Returning `None` means the adapter cannot classify the failure: it surfaces as
/// [`Error::ServiceError`] carrying the native `Display` output verbatim.
///
pub trait Translate: fmt::Display + Send + 'static {
    fn classify(&self) -> Option<ErrorKind>;
}

pub fn translate<N: Translate>(native: N) -> Error {
    match native.classify() {
        Some(ErrorKind::ServiceError) | None => Error::ServiceError(native.to_string()),
        Some(kind) => Error::from_kind(kind, String::new()),
    }
}

///
/// Runs `f` and converts its native failure, if any, into the canonical one.
///
/// Examples
///
/// ```
/// use rust_coordkv::{backend::memory::MemoryError, error::adapt, Error};
///
/// let result: Result<(), Error> = adapt(|| Err(MemoryError::NoNode));
/// assert_eq!(result, Err(Error::NoEntry));
/// ```
///
pub fn adapt<T, N, F>(f: F) -> Result<T, Error>
where
    N: Translate,
    F: FnOnce() -> Result<T, N>,
{
    f().map_err(translate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum NativeCode {
        Missing,
        Duplicate,
        Stale,
        Unreachable,
        Quota(u32),
    }

    impl fmt::Display for NativeCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Missing => f.write_str("missing"),
                Self::Duplicate => f.write_str("duplicate"),
                Self::Stale => f.write_str("stale"),
                Self::Unreachable => f.write_str("unreachable"),
                Self::Quota(n) => write!(f, "quota exceeded: {n} requests"),
            }
        }
    }

    impl Translate for NativeCode {
        fn classify(&self) -> Option<ErrorKind> {
            match self {
                Self::Missing => Some(ErrorKind::NoEntry),
                Self::Duplicate => Some(ErrorKind::EntryExists),
                Self::Stale => Some(ErrorKind::VersionMismatch),
                Self::Unreachable => Some(ErrorKind::ConnectionLoss),
                Self::Quota(_) => None,
            }
        }
    }

    #[test]
    fn classified_failures_map_to_their_kind() {
        assert_eq!(translate(NativeCode::Missing), Error::NoEntry);
        assert_eq!(translate(NativeCode::Duplicate), Error::EntryExists);
        assert_eq!(translate(NativeCode::Stale), Error::VersionMismatch);
        assert_eq!(translate(NativeCode::Unreachable), Error::ConnectionLoss);
    }

    #[test]
    fn unclassified_failure_keeps_native_diagnostic() {
        let err = translate(NativeCode::Quota(42));
        assert_eq!(err, Error::ServiceError("quota exceeded: 42 requests".to_string()));
        assert_eq!(err.kind(), ErrorKind::ServiceError);
    }

    #[test]
    fn adapt_passes_values_through() {
        let ok: Result<u32, Error> = adapt(|| Ok::<_, NativeCode>(7));
        assert_eq!(ok, Ok(7));
        let err: Result<u32, Error> = adapt(|| Err(NativeCode::Stale));
        assert_eq!(err, Err(Error::VersionMismatch));
    }

    #[test]
    fn broken_deferreds_are_canonical_failures() {
        assert_eq!(Error::from(Broken::Abandoned), Error::ConnectionLoss);
        assert_eq!(
            Error::from(Broken::Panicked("boom".to_string())),
            Error::ServiceError("boom".to_string())
        );
    }

    #[test]
    fn from_kind_round_trips_every_kind() {
        for kind in [
            ErrorKind::InvalidAddress,
            ErrorKind::InvalidKey,
            ErrorKind::NoEntry,
            ErrorKind::EntryExists,
            ErrorKind::VersionMismatch,
            ErrorKind::ConnectionLoss,
            ErrorKind::ServiceError,
        ] {
            assert_eq!(Error::from_kind(kind, "diag").kind(), kind);
        }
    }
}
