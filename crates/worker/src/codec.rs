//! Stable textual-name and small-integer-code round trip for control enums.
//!
//! Names and codes are part of the external surface: logs, snapshots and
//! remote peers carry them, so a lookup miss is always an error and never a
//! silent default. Name misses and code misses are distinct variants.

use thiserror::Error;

/// Failure to decode a control enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
	/// No variant carries this textual name.
	#[error("unknown {kind} name: {name:?}")]
	UnknownName {
		/// Enum being decoded.
		kind: &'static str,
		/// The rejected input.
		name: String,
	},
	/// No variant carries this integer code.
	#[error("unknown {kind} code: {code}")]
	UnknownCode {
		/// Enum being decoded.
		kind: &'static str,
		/// The rejected input.
		code: u8,
	},
}

/// Name/code round trip for a fieldless control enum.
pub trait EnumCodec: Sized + Copy + 'static {
	/// Stable enum label used in errors.
	const KIND: &'static str;

	/// Stable textual name of this value.
	fn name(self) -> &'static str;

	/// Stable integer code of this value.
	fn code(self) -> u8;

	/// Parses a textual name produced by [`EnumCodec::name`].
	fn from_name(name: &str) -> Result<Self, CodecError>;

	/// Decodes an integer produced by [`EnumCodec::code`].
	fn from_code(code: u8) -> Result<Self, CodecError>;
}

/// Implements [`EnumCodec`] for a `#[repr(u8)]` enum deriving strum's
/// `EnumString`, `IntoStaticStr` and `FromRepr`.
#[macro_export]
macro_rules! impl_enum_codec {
	($ty:ty, $kind:literal) => {
		impl $crate::codec::EnumCodec for $ty {
			const KIND: &'static str = $kind;

			fn name(self) -> &'static str {
				self.into()
			}

			fn code(self) -> u8 {
				self as u8
			}

			fn from_name(name: &str) -> Result<Self, $crate::codec::CodecError> {
				name.parse::<Self>().map_err(|_| $crate::codec::CodecError::UnknownName {
					kind: $kind,
					name: name.to_owned(),
				})
			}

			fn from_code(code: u8) -> Result<Self, $crate::codec::CodecError> {
				Self::from_repr(code).ok_or($crate::codec::CodecError::UnknownCode { kind: $kind, code })
			}
		}
	};
}
