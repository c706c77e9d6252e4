//! Shadowsocks AEAD primitives: ChaCha20-IETF-Poly1305 with
//! HKDF-SHA1 subkey derivation and the legacy OpenSSL key schedule.

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use hkdf::Hkdf;
use md5::{Digest as _, Md5};
use rand::RngCore;
use sha1::Sha1;

use crate::{CryptoSnafu, FrameTooLargeSnafu, ProtoError};

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const PACKET_LIMIT: usize = 0x3fff;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Legacy `EVP_BytesToKey`: chained MD5 over the previous digest and
/// the password until `size` bytes accumulate.
pub fn evp_bytes_to_key(password: &[u8], size: usize) -> Vec<u8> {
	let mut key = Vec::with_capacity(size + 15);
	let mut previous: Option<[u8; 16]> = None;
	while key.len() < size {
		let mut hasher = Md5::new();
		if let Some(previous) = previous {
			hasher.update(previous);
		}
		hasher.update(password);
		let digest: [u8; 16] = hasher.finalize().into();
		key.extend_from_slice(&digest);
		previous = Some(digest);
	}
	key.truncate(size);
	key
}

/// Password-derived master key; per-direction subkeys come out of
/// HKDF-SHA1 over a random salt.
#[derive(Clone)]
pub struct Cipher {
	master_key: [u8; KEY_SIZE],
}

impl Cipher {
	pub fn new(password: &str) -> Self {
		let key = evp_bytes_to_key(password.as_bytes(), KEY_SIZE);
		let mut master_key = [0u8; KEY_SIZE];
		master_key.copy_from_slice(&key);
		Cipher { master_key }
	}

	fn subkey(&self, salt: &[u8]) -> [u8; KEY_SIZE] {
		let mut okm = [0u8; KEY_SIZE];
		Hkdf::<Sha1>::new(Some(salt), &self.master_key)
			.expand(SUBKEY_INFO, &mut okm)
			.expect("32 bytes is a valid hkdf-sha1 output length");
		okm
	}

	pub fn random_salt() -> [u8; SALT_SIZE] {
		let mut salt = [0u8; SALT_SIZE];
		rand::rng().fill_bytes(&mut salt);
		salt
	}

	pub fn sealer(&self, salt: &[u8]) -> SealKey {
		let subkey = self.subkey(salt);
		SealKey {
			aead:    ChaCha20Poly1305::new(Key::from_slice(&subkey)),
			counter: 0,
		}
	}

	pub fn opener(&self, salt: &[u8]) -> OpenKey {
		let subkey = self.subkey(salt);
		OpenKey {
			aead:    ChaCha20Poly1305::new(Key::from_slice(&subkey)),
			counter: 0,
		}
	}
}

fn nonce(counter: &mut u64) -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	nonce[..8].copy_from_slice(&counter.to_le_bytes());
	*counter += 1;
	nonce
}

/// Encrypting half of one direction; the counter advances once per
/// AEAD call and never rolls back.
pub struct SealKey {
	aead:    ChaCha20Poly1305,
	counter: u64,
}

impl SealKey {
	pub fn seal_chunk(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ProtoError> {
		let nonce = nonce(&mut self.counter);
		self.aead
			.encrypt(Nonce::from_slice(&nonce), plaintext)
			.map_err(|_| CryptoSnafu.build())
	}

	/// Frames `payload` as `seal(len) || seal(payload)`, splitting
	/// left-to-right at the packet limit.
	pub fn seal_frame(&mut self, payload: &[u8], dst: &mut Vec<u8>) -> Result<(), ProtoError> {
		for chunk in payload.chunks(PACKET_LIMIT) {
			let len_bytes = (chunk.len() as u16).to_be_bytes();
			dst.extend_from_slice(&self.seal_chunk(&len_bytes)?);
			dst.extend_from_slice(&self.seal_chunk(chunk)?);
		}
		Ok(())
	}

	pub fn counter(&self) -> u64 {
		self.counter
	}
}

/// Decrypting half of one direction.
pub struct OpenKey {
	aead:    ChaCha20Poly1305,
	counter: u64,
}

impl OpenKey {
	pub fn open_chunk(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtoError> {
		let nonce = nonce(&mut self.counter);
		self.aead
			.decrypt(Nonce::from_slice(&nonce), ciphertext)
			.map_err(|_| CryptoSnafu.build())
	}

	/// Decrypts a length frame and validates it against the packet
	/// limit.
	pub fn open_length(&mut self, ciphertext: &[u8]) -> Result<usize, ProtoError> {
		let plain = self.open_chunk(ciphertext)?;
		let length = u16::from_be_bytes([plain[0], plain[1]]) as usize;
		if length != length & PACKET_LIMIT {
			return FrameTooLargeSnafu { length }.fail();
		}
		Ok(length)
	}

	pub fn counter(&self) -> u64 {
		self.counter
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn key_schedule_is_deterministic() {
		let a = evp_bytes_to_key(b"test", KEY_SIZE);
		let b = evp_bytes_to_key(b"test", KEY_SIZE);
		let c = evp_bytes_to_key(b"other", KEY_SIZE);
		assert_eq!(a.len(), KEY_SIZE);
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	/// Scenario: "hello" under a fresh salt costs exactly
	/// `(2 + 16) + (5 + 16)` ciphertext bytes and two counter steps.
	#[test]
	fn frame_size_and_counter() {
		let cipher = Cipher::new("test");
		let salt = Cipher::random_salt();
		let mut seal = cipher.sealer(&salt);

		let mut sealed = Vec::new();
		seal.seal_frame(b"hello", &mut sealed).unwrap();
		assert_eq!(sealed.len(), 2 + TAG_SIZE + 5 + TAG_SIZE);
		assert_eq!(seal.counter(), 2);

		let mut open = cipher.opener(&salt);
		let length = open.open_length(&sealed[..2 + TAG_SIZE]).unwrap();
		assert_eq!(length, 5);
		let plain = open.open_chunk(&sealed[2 + TAG_SIZE..]).unwrap();
		assert_eq!(&plain, b"hello");
		assert_eq!(open.counter(), 2);
	}

	#[test]
	fn oversized_payload_splits() {
		let cipher = Cipher::new("test");
		let salt = Cipher::random_salt();
		let mut seal = cipher.sealer(&salt);

		let payload = vec![0xa5u8; PACKET_LIMIT + 1];
		let mut sealed = Vec::new();
		seal.seal_frame(&payload, &mut sealed).unwrap();
		// Two frames: PACKET_LIMIT bytes, then 1 byte.
		assert_eq!(sealed.len(), 2 * (2 + TAG_SIZE) + PACKET_LIMIT + TAG_SIZE + 1 + TAG_SIZE);
		assert_eq!(seal.counter(), 4);

		let mut open = cipher.opener(&salt);
		let mut offset = 0;
		let mut plain = Vec::new();
		while offset < sealed.len() {
			let length = open.open_length(&sealed[offset..offset + 2 + TAG_SIZE]).unwrap();
			offset += 2 + TAG_SIZE;
			plain.extend(open.open_chunk(&sealed[offset..offset + length + TAG_SIZE]).unwrap());
			offset += length + TAG_SIZE;
		}
		assert_eq!(plain, payload);
	}

	#[test]
	fn tampering_is_detected() {
		let cipher = Cipher::new("test");
		let salt = Cipher::random_salt();
		let mut seal = cipher.sealer(&salt);
		let mut sealed = Vec::new();
		seal.seal_frame(b"payload", &mut sealed).unwrap();
		sealed[3] ^= 0x01;

		let mut open = cipher.opener(&salt);
		assert!(matches!(
			open.open_length(&sealed[..2 + TAG_SIZE]),
			Err(ProtoError::Crypto { .. })
		));
	}

	#[test]
	fn wrong_salt_fails() {
		let cipher = Cipher::new("test");
		let mut seal = cipher.sealer(&Cipher::random_salt());
		let mut sealed = Vec::new();
		seal.seal_frame(b"payload", &mut sealed).unwrap();

		let mut open = cipher.opener(&Cipher::random_salt());
		assert!(open.open_length(&sealed[..2 + TAG_SIZE]).is_err());
	}

	#[test]
	fn ciphertext_hides_plaintext() {
		let cipher = Cipher::new("hunter2");
		let salt = Cipher::random_salt();
		let mut seal = cipher.sealer(&salt);
		let mut sealed = Vec::new();
		let secret = b"extremely secret payload bytes";
		seal.seal_frame(secret, &mut sealed).unwrap();
		assert!(!sealed.windows(secret.len()).any(|window| window == secret));
		assert!(!sealed.windows(7).any(|window| window == b"hunter2"));
	}
}
