//! Key derivation and packet protection based on *ring*
//!
//! Derives AEAD and header-protection ciphers from traffic secrets with the
//! QUIC KDF labels, and implements the initial secret schedule.

use ring::{aead, hkdf};

use crate::{
    crypto::{CipherSuite, CryptoError, HeaderKey, KeyPair, Keys, PacketKey},
    packet::LONG_HEADER_FORM,
    Side,
};

/// Salt for the initial secret, fixed by the wire version we implement
const INITIAL_SALT: [u8; 20] = [
    0xef, 0x4f, 0xb0, 0xab, 0xb4, 0x74, 0x70, 0xc4, 0x1b, 0xef, 0xcf, 0x80, 0x31, 0x33, 0x4f,
    0xae, 0x48, 0x5e, 0x09, 0xa0,
];

/// KDF label for AEAD keys. Wire-relevant: changing it breaks interop.
const KEY_LABEL: &[u8] = b"quic key";
/// KDF label for AEAD IVs. Wire-relevant.
const IV_LABEL: &[u8] = b"quic iv";
/// KDF label for header protection keys. Wire-relevant.
const HP_LABEL: &[u8] = b"quic hp";

/// Derive packet protection keys for both directions of the Initial space
///
/// Both endpoints compute these from the client's first destination CID, so a
/// test peer can derive the server side of the conversation.
pub fn initial_keys(dcid: &[u8], side: Side) -> KeyPair {
    let initial_secret = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(dcid);
    let client = expand_initial(&initial_secret, b"client in");
    let server = expand_initial(&initial_secret, b"server in");
    let (read, write) = match side {
        Side::Client => (server, client),
        Side::Server => (client, server),
    };
    KeyPair {
        read: keys_from_secret(CipherSuite::Aes128GcmSha256, &read),
        write: keys_from_secret(CipherSuite::Aes128GcmSha256, &write),
    }
}

fn expand_initial(initial_secret: &hkdf::Prk, label: &[u8]) -> [u8; 32] {
    let mut secret = [0; 32];
    hkdf_expand_label(initial_secret, label, &mut secret);
    secret
}

/// Derive one direction's packet protection keys from a TLS traffic secret
pub fn keys_from_secret(suite: CipherSuite, secret: &[u8]) -> Keys {
    let prk = hkdf::Prk::new_less_safe(suite.hkdf(), secret);

    let mut key = [0; 32];
    let key = &mut key[..suite.aead().key_len()];
    hkdf_expand_label(&prk, KEY_LABEL, key);
    let mut iv = [0; aead::NONCE_LEN];
    hkdf_expand_label(&prk, IV_LABEL, &mut iv);
    let mut hp = [0; 32];
    let hp = &mut hp[..suite.header_protection().key_len()];
    hkdf_expand_label(&prk, HP_LABEL, hp);

    Keys {
        packet: Box::new(AeadKey {
            key: aead::LessSafeKey::new(
                aead::UnboundKey::new(suite.aead(), key).expect("key length follows the suite"),
            ),
            iv,
        }),
        header: Box::new(
            aead::quic::HeaderProtectionKey::new(suite.header_protection(), hp)
                .expect("key length follows the suite"),
        ),
    }
}

impl CipherSuite {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128GcmSha256 => &aead::AES_128_GCM,
            Self::Aes256GcmSha384 => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305Sha256 => &aead::CHACHA20_POLY1305,
        }
    }

    fn header_protection(self) -> &'static aead::quic::Algorithm {
        match self {
            Self::Aes128GcmSha256 => &aead::quic::AES_128,
            Self::Aes256GcmSha384 => &aead::quic::AES_256,
            Self::ChaCha20Poly1305Sha256 => &aead::quic::CHACHA20,
        }
    }

    fn hkdf(self) -> hkdf::Algorithm {
        match self {
            Self::Aes256GcmSha384 => hkdf::HKDF_SHA384,
            _ => hkdf::HKDF_SHA256,
        }
    }
}

/// HKDF-Expand-Label from RFC 8446 §7.1
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const LABEL_PREFIX: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(2 + 1 + LABEL_PREFIX.len() + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((LABEL_PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(LABEL_PREFIX);
    info.extend_from_slice(label);
    // Empty context
    info.push(0);
    prk.expand(&[info.as_slice()], OutLen(out.len()))
        .expect("output length within HKDF bounds")
        .fill(out)
        .expect("output length matches");
}

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

struct AeadKey {
    key: aead::LessSafeKey,
    iv: [u8; aead::NONCE_LEN],
}

impl AeadKey {
    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, pn) in nonce[aead::NONCE_LEN - 8..]
            .iter_mut()
            .zip(packet.to_be_bytes())
        {
            *b ^= pn;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl PacketKey for AeadKey {
    fn encrypt(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize) {
        let tag = {
            let (header, payload) = buf.split_at_mut(header_len);
            self.key
                .seal_in_place_separate_tag(self.nonce(packet), aead::Aad::from(&*header), payload)
                .expect("payload within AEAD limits")
        };
        buf.extend_from_slice(tag.as_ref());
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut bytes::BytesMut,
    ) -> Result<(), CryptoError> {
        let plain_len = self
            .key
            .open_in_place(self.nonce(packet), aead::Aad::from(header), payload.as_mut())
            .map_err(|_| CryptoError)?
            .len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

impl HeaderKey for aead::quic::HeaderProtectionKey {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self
            .new_mask(&sample[0..self.algorithm().sample_len()])
            .expect("sample length follows the algorithm");
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            // Long header: 4 bits masked
            header[0] ^= mask[0] & 0x0f;
        } else {
            // Short header: 5 bits masked
            header[0] ^= mask[0] & 0x1f;
        }
        let pn_length = (header[0] & 0x03) as usize + 1;
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self
            .new_mask(&sample[0..self.algorithm().sample_len()])
            .expect("sample length follows the algorithm");
        let pn_length = (header[0] & 0x03) as usize + 1;
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            header[0] ^= mask[0] & 0x0f;
        } else {
            header[0] ^= mask[0] & 0x1f;
        }
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    fn sample_size(&self) -> usize {
        self.algorithm().sample_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use hex_literal::hex;

    #[test]
    fn initial_keys_are_complementary() {
        let dcid = hex!("06b858ec6f80452b");
        let client = initial_keys(&dcid, Side::Client);
        let server = initial_keys(&dcid, Side::Server);

        let mut buf = b"headerpayload".to_vec();
        client.write.packet.encrypt(0, &mut buf, 6);
        let mut payload = BytesMut::from(&buf[6..]);
        server
            .read
            .packet
            .decrypt(0, b"header", &mut payload)
            .unwrap();
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn tampered_packet_fails_to_decrypt() {
        let dcid = hex!("06b858ec6f80452b");
        let client = initial_keys(&dcid, Side::Client);
        let server = initial_keys(&dcid, Side::Server);

        let mut buf = b"headerpayload".to_vec();
        client.write.packet.encrypt(1, &mut buf, 6);
        buf[7] ^= 0xff;
        let mut payload = BytesMut::from(&buf[6..]);
        assert_eq!(
            server.read.packet.decrypt(1, b"header", &mut payload),
            Err(CryptoError)
        );
    }

    #[test]
    fn derived_keys_roundtrip_per_suite() {
        for suite in [
            CipherSuite::Aes128GcmSha256,
            CipherSuite::Aes256GcmSha384,
            CipherSuite::ChaCha20Poly1305Sha256,
        ] {
            let secret = [0x42; 48];
            let a = keys_from_secret(suite, &secret);
            let b = keys_from_secret(suite, &secret);
            let mut buf = b"hdrsome plaintext".to_vec();
            a.packet.encrypt(7, &mut buf, 3);
            assert_eq!(buf.len(), 17 + a.packet.tag_len());
            let mut payload = BytesMut::from(&buf[3..]);
            b.packet.decrypt(7, b"hdr", &mut payload).unwrap();
            assert_eq!(&payload[..], b"some plaintext");
        }
    }

    #[test]
    fn header_protection_roundtrips() {
        let secret = [0x17; 32];
        let keys = keys_from_secret(CipherSuite::Aes128GcmSha256, &secret);
        // Short header packet: flags w/ 2-byte pn, 8-byte dcid, pn, sample
        let mut packet = vec![0x41, 0, 0, 0, 0, 0, 0, 0, 0, 0xab, 0xcd];
        packet.extend_from_slice(&[0x5a; 24]);
        let clear = packet.clone();
        let pn_offset = 9;
        keys.header.encrypt(pn_offset, &mut packet);
        assert_ne!(packet[..pn_offset + 2], clear[..pn_offset + 2]);
        keys.header.decrypt(pn_offset, &mut packet);
        assert_eq!(packet, clear);
    }
}
