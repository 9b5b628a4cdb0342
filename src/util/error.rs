//! Module containing the error type used by all TFS crates

use err_derive::Error;

/// Errors of this crate
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "Messagepack encode error: {}", _0)]
	RmpEncode(#[error(source)] rmp_serde::encode::Error),

	#[error(display = "Messagepack decode error: {}", _0)]
	RmpDecode(#[error(source)] rmp_serde::decode::Error),

	#[error(display = "Tokio join error: {}", _0)]
	TokioJoin(#[error(source)] tokio::task::JoinError),

	#[error(display = "Invalid TOML: {}", _0)]
	Toml(#[error(source)] toml::de::Error),

	#[error(display = "Not found: {}", _0)]
	NotFound(String),

	#[error(display = "Already exists: {}", _0)]
	AlreadyExists(String),

	#[error(display = "Busy: {}", _0)]
	Busy(String),

	#[error(display = "Stale version: have {}, got {}", have, got)]
	StaleVersion { have: u32, got: u32 },

	#[error(display = "CRC mismatch: stored {:#010x}, computed {:#010x}", stored, computed)]
	CrcError { stored: u32, computed: u32 },

	#[error(display = "Capacity exhausted: {}", _0)]
	CapacityExhausted(String),

	#[error(display = "Network error: {}", _0)]
	Network(String),

	#[error(display = "Not the leader: {}", _0)]
	NotLeader(String),

	#[error(display = "Unauthorized: {}", _0)]
	Unauthorized(String),

	#[error(display = "Corrupt data: {}", _0)]
	CorruptData(String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	/// Kind tag used when a local error crosses the wire as a status reply
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::NotFound(_) => ErrorKind::NotFound,
			Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
			Error::Busy(_) => ErrorKind::Busy,
			Error::StaleVersion { .. } => ErrorKind::StaleVersion,
			Error::CrcError { .. } | Error::CorruptData(_) => ErrorKind::CrcError,
			Error::CapacityExhausted(_) => ErrorKind::CapacityExhausted,
			Error::Network(_) => ErrorKind::Network,
			Error::NotLeader(_) => ErrorKind::NotLeader,
			Error::Unauthorized(_) => ErrorKind::Unauthorized,
			Error::Io(_) => ErrorKind::Io,
			_ => ErrorKind::Other,
		}
	}

	pub fn unexpected_message<M: std::fmt::Debug>(msg: M) -> Self {
		Error::Message(format!("Unexpected message: {:?}", msg))
	}
}

/// Coarse error classification, shared with the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
	NotFound,
	AlreadyExists,
	Busy,
	StaleVersion,
	CrcError,
	CapacityExhausted,
	Network,
	NotLeader,
	Unauthorized,
	Io,
	Other,
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::watch::error::SendError<T>) -> Error {
		Error::Message("Watch channel send error".into())
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Error {
		Error::Message("MPSC channel send error".into())
	}
}

/// Trait to map error types to `Error::Message`
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Ok(x) => Ok(x),
			Err(e) => Err(Error::Message(format!("{}: {}", message.into(), e))),
		}
	}
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::Message(message.into())),
		}
	}
}
