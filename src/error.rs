use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors produced by this crate.
///
/// Every fallible path returns one of these by value instead of relying on
/// a thread-local diagnostic record: callers that only care whether an
/// operation succeeded can match on `Result::Err`, and callers that want to
/// log or report the failure have a `Display` impl and, for `Io`, the
/// original `std::io::Error` (which on unix exposes `.raw_os_error()`).
#[derive(Debug)]
pub enum Error {
	/// A syscall-backed operation failed (open, mmap, fdatasync, ...).
	Io { path: Option<PathBuf>, source: io::Error },
	/// A store file failed validation: bad magic, missing stamp, an
	/// offset that doesn't fit inside the mapping, and so on.
	Corruption(String),
	/// The file's header version isn't in the supported set.
	UnsupportedVersion(u32),
	/// An encoder ran out of room in its pre-sized output buffer.
	CapacityExceeded { needed: usize, available: usize },
	/// A caller passed something the API can't act on (empty row set,
	/// zero key/value, malformed path).
	InvalidArgument(String),
}

impl Error {
	pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Error {
		Error::Io { path: Some(path.into()), source }
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io { path: Some(path), source } =>
				write!(f, "io error on '{}': {}", path.display(), source),
			Error::Io { path: None, source } =>
				write!(f, "io error: {}", source),
			Error::Corruption(detail) =>
				write!(f, "corrupt store: {}", detail),
			Error::UnsupportedVersion(version) =>
				write!(f, "unsupported store version: {}", version),
			Error::CapacityExceeded { needed, available } =>
				write!(f, "capacity exceeded: needed {} bytes, had {}", needed, available),
			Error::InvalidArgument(detail) =>
				write!(f, "invalid argument: {}", detail),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io { source, .. } => Some(source),
			_ => None,
		}
	}
}

impl From<io::Error> for Error {
	fn from(source: io::Error) -> Error {
		Error::Io { path: None, source }
	}
}

pub type Result<T> = std::result::Result<T, Error>;
