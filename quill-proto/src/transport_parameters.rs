//! QUIC connection transport parameters
//!
//! The `TransportParameters` type is used to represent the transport parameters
//! negotiated by peers while establishing the connection. This process happens
//! as part of the establishment of the TLS session.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    ConnectionId, TransportError, VarInt,
};

/// IDs at and above this value are private (custom) parameters
pub const CUSTOM_PARAMETER_FLOOR: u64 = 0x3fff;

// Apply a given macro to a list of all the transport parameters having integer
// types, along with their codes and default values. This avoids error-prone
// duplication across the `Default` impl, encoding, and decoding.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // name (id) = default,
            max_idle_timeout(0x0001) = 0,
            max_udp_payload_size(0x0003) = 65527,
            initial_max_data(0x0004) = 0,
            initial_max_stream_data_bidi_local(0x0005) = 0,
            initial_max_stream_data_bidi_remote(0x0006) = 0,
            initial_max_stream_data_uni(0x0007) = 0,
            initial_max_streams_bidi(0x0008) = 0,
            initial_max_streams_uni(0x0009) = 0,
            ack_delay_exponent(0x000a) = 3,
            max_ack_delay(0x000b) = 25,
            active_connection_id_limit(0x000e) = 2,
        }
    };
}

macro_rules! make_struct {
    {$($name:ident ($code:expr) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level limits
        #[derive(Debug, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $(pub $name: u64,)*

            /// The endpoint does not support active connection migration
            pub disable_active_migration: bool,
            /// The DCID from the first Initial packet, echoed by the server
            pub original_destination_connection_id: Option<ConnectionId>,
            /// The SCID of the first packet the sender emits
            pub initial_source_connection_id: Option<ConnectionId>,
            /// Token used by the client to verify a stateless reset
            pub stateless_reset_token: Option<[u8; 16]>,
            /// Private parameters, IDs at or above 0x3fff, in registration order
            pub(crate) custom: Vec<(VarInt, Vec<u8>)>,
        }

        impl Default for TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            fn default() -> Self {
                Self {
                    $($name: $default,)*

                    disable_active_migration: false,
                    original_destination_connection_id: None,
                    initial_source_connection_id: None,
                    stateless_reset_token: None,
                    custom: Vec::new(),
                }
            }
        }
    }
}

apply_params!(make_struct);

impl TransportParameters {
    /// Register a private parameter to be emitted in the ClientHello extension
    ///
    /// IDs below 0x3fff are reserved for standard parameters; an ID may only be
    /// registered once.
    pub fn add_custom(&mut self, id: VarInt, value: Vec<u8>) -> Result<(), Error> {
        if id.into_inner() < CUSTOM_PARAMETER_FLOOR {
            return Err(Error::ReservedCustomParameter);
        }
        if self.custom.iter().any(|(existing, _)| *existing == id) {
            return Err(Error::DuplicateCustomParameter);
        }
        self.custom.push((id, value));
        Ok(())
    }

    /// The value of a previously registered or received private parameter
    pub fn custom(&self, id: VarInt) -> Option<&[u8]> {
        self.custom
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, v)| &v[..])
    }

    /// Whether the subset of parameters 0-RTT data was sent under still holds
    ///
    /// Early data is bound to the limits the client remembered from the
    /// previous connection; if the server changed any of them the data cannot
    /// be transparently replayed.
    pub fn resumption_subset_matches(&self, cached: &Self) -> bool {
        self.initial_max_data == cached.initial_max_data
            && self.initial_max_stream_data_bidi_local == cached.initial_max_stream_data_bidi_local
            && self.initial_max_stream_data_bidi_remote
                == cached.initial_max_stream_data_bidi_remote
            && self.initial_max_stream_data_uni == cached.initial_max_stream_data_uni
            && self.initial_max_streams_bidi == cached.initial_max_streams_bidi
            && self.initial_max_streams_uni == cached.initial_max_streams_uni
    }

    pub fn write<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($name:ident ($code:expr) = $default:expr,)*} => {
                $(
                    if self.$name != $default {
                        w.write_var($code);
                        w.write_var(VarInt::from_u64(self.$name).expect("parameter fits varint").size() as u64);
                        w.write_var(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if self.disable_active_migration {
            w.write_var(0x000c);
            w.write_var(0);
        }
        if let Some(ref cid) = self.original_destination_connection_id {
            w.write_var(0x0000);
            w.write_var(cid.len() as u64);
            w.put_slice(cid);
        }
        if let Some(ref token) = self.stateless_reset_token {
            w.write_var(0x0002);
            w.write_var(16);
            w.put_slice(token);
        }
        if let Some(ref cid) = self.initial_source_connection_id {
            w.write_var(0x000f);
            w.write_var(cid.len() as u64);
            w.put_slice(cid);
        }
        for (id, value) in &self.custom {
            w.write_var(id.into_inner());
            w.write_var(value.len() as u64);
            w.put_slice(value);
        }
    }

    pub fn read<R: Buf>(r: &mut R) -> Result<Self, Error> {
        // State to check for duplicate transport parameters.
        macro_rules! param_state {
            {$($name:ident ($code:expr) = $default:expr,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }
                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);
        let mut params = Self::default();

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()? as usize;
            if r.remaining() < len {
                return Err(Error::Malformed);
            }

            match id {
                0x0000 => {
                    if params.original_destination_connection_id.is_some() {
                        return Err(Error::Malformed);
                    }
                    params.original_destination_connection_id =
                        Some(Self::read_cid(r, len)?);
                }
                0x0002 => {
                    if len != 16 || params.stateless_reset_token.is_some() {
                        return Err(Error::Malformed);
                    }
                    let mut token = [0; 16];
                    r.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                0x000c => {
                    if len != 0 || params.disable_active_migration {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                0x000f => {
                    if params.initial_source_connection_id.is_some() {
                        return Err(Error::Malformed);
                    }
                    params.initial_source_connection_id = Some(Self::read_cid(r, len)?);
                }
                id if id >= CUSTOM_PARAMETER_FLOOR => {
                    let id = VarInt::from_u64(id).map_err(|_| Error::Malformed)?;
                    if params.custom.iter().any(|(existing, _)| *existing == id) {
                        return Err(Error::Malformed);
                    }
                    let mut value = vec![0; len];
                    r.copy_to_slice(&mut value);
                    params.custom.push((id, value));
                }
                _ => {
                    macro_rules! parse {
                        {$($name:ident ($code:expr) = $default:expr,)*} => {
                            match id {
                                $($code => {
                                    if got.$name {
                                        return Err(Error::Malformed);
                                    }
                                    let before = r.remaining();
                                    params.$name = r.get_var()?;
                                    if before - r.remaining() != len {
                                        return Err(Error::Malformed);
                                    }
                                    got.$name = true;
                                })*
                                // Unknown standard-range parameters are skipped
                                _ => r.advance(len),
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        if params.ack_delay_exponent > 20
            || params.max_ack_delay >= 1 << 14
            || params.max_udp_payload_size < 1200
            || params.active_connection_id_limit < 2
        {
            return Err(Error::IllegalValue);
        }

        Ok(params)
    }

    fn read_cid<R: Buf>(r: &mut R, len: usize) -> Result<ConnectionId, Error> {
        if len > crate::packet::MAX_CID_SIZE {
            return Err(Error::Malformed);
        }
        let mut stage = [0; crate::packet::MAX_CID_SIZE];
        r.copy_to_slice(&mut stage[..len]);
        Ok(ConnectionId::new(&stage[..len]))
    }
}

/// Errors encountered while decoding or registering `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// Parameter had an illegal value
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Parameters were malformed
    #[error("parameters were malformed")]
    Malformed,
    /// A custom parameter ID was registered twice
    #[error("duplicate custom parameter ID")]
    DuplicateCustomParameter,
    /// A custom parameter used an ID reserved for standard parameters
    #[error("custom parameter ID in the reserved range")]
    ReservedCustomParameter,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        Self::TRANSPORT_PARAMETER_ERROR(e.to_string())
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding() {
        let mut params = TransportParameters {
            initial_max_data: 42,
            initial_max_stream_data_bidi_local: 10,
            initial_max_stream_data_bidi_remote: 11,
            initial_max_stream_data_uni: 12,
            initial_max_streams_bidi: 8,
            initial_max_streams_uni: 4,
            max_idle_timeout: 30_000,
            max_udp_payload_size: 1452,
            disable_active_migration: true,
            initial_source_connection_id: Some(ConnectionId::new(&[0xab; 8])),
            stateless_reset_token: Some([0xcd; 16]),
            ..TransportParameters::default()
        };
        params.add_custom(VarInt::from_u32(0x4000), b"opaque".to_vec()).unwrap();
        params.add_custom(VarInt::from_u32(0xffff), Vec::new()).unwrap();

        let mut buf = Vec::new();
        params.write(&mut buf);
        assert_eq!(TransportParameters::read(&mut &buf[..]).unwrap(), params);
    }

    #[test]
    fn custom_id_rules() {
        let mut params = TransportParameters::default();
        assert_eq!(
            params.add_custom(VarInt::from_u32(0x3ffe), Vec::new()),
            Err(Error::ReservedCustomParameter)
        );
        params.add_custom(VarInt::from_u32(0x3fff), b"a".to_vec()).unwrap();
        assert_eq!(
            params.add_custom(VarInt::from_u32(0x3fff), b"b".to_vec()),
            Err(Error::DuplicateCustomParameter)
        );
        assert_eq!(params.custom(VarInt::from_u32(0x3fff)), Some(&b"a"[..]));
    }

    #[test]
    fn duplicate_on_wire_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(0x0004);
            buf.write_var(1);
            buf.write_var(7);
        }
        assert_eq!(
            TransportParameters::read(&mut &buf[..]),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn illegal_values_rejected() {
        let mut buf = Vec::new();
        buf.write_var(0x000a);
        buf.write_var(1);
        buf.write_var(21);
        assert_eq!(
            TransportParameters::read(&mut &buf[..]),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn resumption_subset() {
        let cached = TransportParameters {
            initial_max_data: 1000,
            initial_max_streams_bidi: 10,
            ..TransportParameters::default()
        };
        let mut new = cached.clone();
        assert!(new.resumption_subset_matches(&cached));
        // Unrelated parameters may change freely
        new.max_idle_timeout = 60_000;
        assert!(new.resumption_subset_matches(&cached));
        new.initial_max_data = 999;
        assert!(!new.resumption_subset_matches(&cached));
    }
}
