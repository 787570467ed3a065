//! Symmetric encryption of RTP payloads.
//!
//! The voice server hands out a 32-byte session key in SESSION_DESCRIPTION;
//! every outbound packet is `header || seal(mode, payload)`.

use rand::Rng;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

use crate::error::VoiceError;

/// Session key length.
pub const KEY_SIZE: usize = 32;

/// XSalsa20 nonce length.
pub const NONCE_SIZE: usize = 24;

/// RTP header length.
pub const RTP_HEADER_SIZE: usize = 12;

/// Modes this crate can produce, in local preference order.
///
/// `xsalsa20_poly1305_lite` is reserved and rejected until implemented.
pub const SUPPORTED_MODES: [&str; 2] = ["xsalsa20_poly1305_suffix", "xsalsa20_poly1305"];

/// Filter the server's offer down to what we support, preserving the
/// server's order. An empty result means no session is possible.
pub fn negotiate_modes(offered: &[String]) -> Vec<String> {
    offered
        .iter()
        .filter(|mode| SUPPORTED_MODES.contains(&mode.as_str()))
        .cloned()
        .collect()
}

/// Seals RTP payloads under the session key.
#[derive(Clone)]
pub struct Encryptor {
    cipher: XSalsa20Poly1305,
}

impl Encryptor {
    pub fn new(secret_key: &[u8]) -> Result<Self, VoiceError> {
        if secret_key.len() != KEY_SIZE {
            return Err(VoiceError::Encryption(format!(
                "expected a {KEY_SIZE}-byte key, got {}",
                secret_key.len()
            )));
        }
        Ok(Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(secret_key)),
        })
    }

    /// Encrypt `payload` for transmission after `header` using `mode`.
    pub fn encrypt(
        &self,
        mode: &str,
        header: &[u8; RTP_HEADER_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>, VoiceError> {
        match mode {
            "xsalsa20_poly1305_suffix" => self.seal_suffix(header, payload),
            "xsalsa20_poly1305" => self.seal_header_nonce(header, payload),
            // The reserved xsalsa20_poly1305_lite lands here too.
            other => Err(VoiceError::UnsupportedMode(other.to_string())),
        }
    }

    /// A random 24-byte nonce, appended to the packet.
    fn seal_suffix(
        &self,
        header: &[u8; RTP_HEADER_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>, VoiceError> {
        let nonce_bytes: [u8; NONCE_SIZE] = rand::rng().random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| VoiceError::Encryption("sealing failed".to_string()))?;

        let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + ciphertext.len() + NONCE_SIZE);
        packet.extend_from_slice(header);
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&nonce_bytes);
        Ok(packet)
    }

    /// The nonce is the RTP header followed by twelve zero bytes; nothing is
    /// appended to the packet.
    fn seal_header_nonce(
        &self,
        header: &[u8; RTP_HEADER_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>, VoiceError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..RTP_HEADER_SIZE].copy_from_slice(header);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| VoiceError::Encryption("sealing failed".to_string()))?;

        let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + ciphertext.len());
        packet.extend_from_slice(header);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> [u8; RTP_HEADER_SIZE] {
        [0x80, 0x78, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
    }

    #[test]
    fn negotiation_keeps_server_order() {
        let offered = vec![
            "xsalsa20_poly1305".to_string(),
            "aead_aes256_gcm".to_string(),
            "xsalsa20_poly1305_suffix".to_string(),
        ];
        assert_eq!(
            negotiate_modes(&offered),
            vec!["xsalsa20_poly1305", "xsalsa20_poly1305_suffix"]
        );
    }

    #[test]
    fn negotiation_rejects_unknown_and_reserved_modes() {
        let offered = vec![
            "xsalsa20_poly1305_lite".to_string(),
            "aead_xchacha20_poly1305_rtpsize".to_string(),
        ];
        assert!(negotiate_modes(&offered).is_empty());
    }

    #[test]
    fn lite_mode_is_rejected_cleanly() {
        let encryptor = Encryptor::new(&[7u8; KEY_SIZE]).unwrap();
        let err = encryptor
            .encrypt("xsalsa20_poly1305_lite", &test_header(), b"audio")
            .unwrap_err();
        assert!(matches!(err, VoiceError::UnsupportedMode(mode) if mode == "xsalsa20_poly1305_lite"));
    }

    #[test]
    fn short_keys_are_refused() {
        assert!(Encryptor::new(&[0u8; 16]).is_err());
    }

    #[test]
    fn header_nonce_mode_uses_the_rtp_header_as_nonce() {
        let key = [9u8; KEY_SIZE];
        let encryptor = Encryptor::new(&key).unwrap();
        let header = test_header();
        let payload = b"twenty milliseconds of opus";

        let packet = encryptor.encrypt("xsalsa20_poly1305", &header, payload).unwrap();
        assert_eq!(&packet[..RTP_HEADER_SIZE], &header);

        // Rebuild the nonce the mode demands: the header in the first 12
        // bytes, zeros in the last 12. Decrypting with it must recover the
        // payload.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..RTP_HEADER_SIZE].copy_from_slice(&header);

        let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), &packet[RTP_HEADER_SIZE..])
            .expect("header-derived nonce must decrypt the payload");
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn suffix_mode_appends_the_nonce() {
        let key = [3u8; KEY_SIZE];
        let encryptor = Encryptor::new(&key).unwrap();
        let header = test_header();
        let payload = b"suffix mode audio";

        let packet = encryptor
            .encrypt("xsalsa20_poly1305_suffix", &header, payload)
            .unwrap();
        assert_eq!(&packet[..RTP_HEADER_SIZE], &header);

        let nonce_start = packet.len() - NONCE_SIZE;
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&packet[nonce_start..]),
                &packet[RTP_HEADER_SIZE..nonce_start],
            )
            .expect("appended nonce must decrypt the payload");
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn suffix_nonces_are_unique_per_packet() {
        let encryptor = Encryptor::new(&[1u8; KEY_SIZE]).unwrap();
        let header = test_header();

        let a = encryptor.encrypt("xsalsa20_poly1305_suffix", &header, b"x").unwrap();
        let b = encryptor.encrypt("xsalsa20_poly1305_suffix", &header, b"x").unwrap();
        assert_ne!(a[a.len() - NONCE_SIZE..], b[b.len() - NONCE_SIZE..]);
    }

    #[test]
    fn tampered_packets_fail_authentication() {
        // Flipping a ciphertext byte must fail decryption.
        let key = [5u8; KEY_SIZE];
        let encryptor = Encryptor::new(&key).unwrap();
        let header = test_header();

        let mut packet = encryptor.encrypt("xsalsa20_poly1305", &header, b"payload").unwrap();
        packet[RTP_HEADER_SIZE] ^= 0xFF;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes[..RTP_HEADER_SIZE].copy_from_slice(&header);
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
        assert!(cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), &packet[RTP_HEADER_SIZE..])
            .is_err());
    }
}
