use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt, Codec};

/// Transport-level errors occur when a peer violates the protocol specification
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub struct TransportError {
    /// Type of error
    pub code: Code,
    /// Frame type that triggered the error
    pub frame: Option<u64>,
    /// Human-readable explanation of the reason
    pub reason: String,
}

impl TransportError {
    pub(crate) fn crypto(alert: u8, reason: impl Into<String>) -> Self {
        Self {
            code: Code::crypto(alert),
            frame: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code;
        write!(f, "{code}")?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Transport-level error code
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Code(u64);

impl Code {
    /// Create QUIC error code from TLS alert code
    pub const fn crypto(code: u8) -> Self {
        Self(0x100 | code as u64)
    }

    /// The TLS alert this code corresponds to, if any
    pub const fn tls_alert(self) -> Option<u8> {
        if self.0 >= 0x100 && self.0 < 0x200 {
            Some((self.0 & 0xff) as u8)
        } else {
            None
        }
    }
}

impl From<Code> for u64 {
    fn from(x: Code) -> Self {
        x.0
    }
}

impl Codec for Code {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0)
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl Code {
            $(#[doc = $desc] pub const $name: Self = Code($val);)*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x100..0x200).contains(&x) => write!(f, "Code::crypto({:02x})", self.0 as u8),
                    _ => write!(f, "Code({:x})", self.0),
                }
            }
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let x = match self.0 {
                    $($val => $desc,)*
                    _ if self.0 >= 0x100 && self.0 < 0x200 => "the cryptographic handshake failed",
                    _ => "unknown error",
                };
                f.write_str(x)
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    SERVER_BUSY(0x2) "the server is currently busy and does not accept any new connections";
    FLOW_CONTROL_ERROR(0x3) "an endpoint received more data than it permitted in its advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "an endpoint received a frame for a stream identifier that exceeded its advertised stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5) "an endpoint received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "an endpoint received a STREAM frame containing data that exceeded the previously established final size";
    FRAME_ENCODING_ERROR(0x7) "an endpoint received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "an endpoint received transport parameters that were badly formatted, included an invalid value, were absent even though they are mandatory, were present though they are forbidden, or are otherwise in error";
    PROTOCOL_VIOLATION(0xA) "an endpoint detected an error with protocol compliance that was not covered by more specific error codes";
}

impl TransportError {
    pub(crate) fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame: None,
            reason: reason.into(),
        }
    }
}

macro_rules! make_constructors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(
                #[doc = $desc]
                #[allow(non_snake_case, unused)]
                pub(crate) fn $name<T: Into<String>>(reason: T) -> Self {
                    Self::new(Code::$name, reason)
                }
            )*
        }
    }
}

make_constructors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    FLOW_CONTROL_ERROR(0x3) "an endpoint received more data than it permitted in its advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "an endpoint received a frame for a stream identifier that exceeded its advertised stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5) "an endpoint received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "an endpoint received a STREAM frame containing data that exceeded the previously established final size";
    FRAME_ENCODING_ERROR(0x7) "an endpoint received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "an endpoint received transport parameters that were in error";
    PROTOCOL_VIOLATION(0xA) "an endpoint detected an error with protocol compliance that was not covered by more specific error codes";
}

/// Failures that originate in this client rather than on the wire
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum LocalError {
    /// The peer rejected 0-RTT and changed the transport parameters the early
    /// data was sent under, so the data cannot be transparently replayed
    #[error("early data rejected with changed parameters")]
    EarlyDataRejected,
    /// The connection was reset by the peer
    #[error("connection reset")]
    ConnectionReset,
    /// The idle timeout expired with no activity in either direction
    #[error("idle timeout expired")]
    IdleTimeout,
    /// The cryptographic handshake could not be completed
    #[error("handshake failed")]
    HandshakeFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_formatting() {
        assert_eq!(format!("{:?}", Code::PROTOCOL_VIOLATION), "PROTOCOL_VIOLATION");
        assert_eq!(format!("{:?}", Code::crypto(0x28)), "Code::crypto(28)");
        assert_eq!(Code::crypto(0x28).tls_alert(), Some(0x28));
        assert_eq!(Code::NO_ERROR.tls_alert(), None);
    }

    #[test]
    fn code_roundtrip() {
        let mut buf = Vec::new();
        Code::FLOW_CONTROL_ERROR.encode(&mut buf);
        let decoded = Code::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, Code::FLOW_CONTROL_ERROR);
    }
}
