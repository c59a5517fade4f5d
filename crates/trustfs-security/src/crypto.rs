//! AES-256-GCM envelopes, the per-thread IV cache, the key-file codec and the
//! random/hash helpers.
//!
//! An envelope is `[signature][iv: 16][ciphertext][tag: 16]`. The 4-byte
//! signature is present only with the `validate-encrypted-data` feature.
//!
//! IVs come from a thread-local cache: a random 16-byte base drawn once per
//! `iv_refresh_interval` encryptions, with a per-use counter added to its low
//! 8 bytes. IVs are unique within one seed on one thread. Across threads and
//! reseeds uniqueness rests on the 128-bit random base, so two threads collide
//! only if their bases land within `iv_refresh_interval` of each other in the
//! low half and match exactly in the high half.

use std::cell::RefCell;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Result, SecurityError};
use crate::keys::{Key, KEY_SIZE};

/// AES-256-GCM with a 16-byte nonce.
type Cipher = AesGcm<Aes256, U16>;

/// IV length in bytes.
pub const IV_SIZE: usize = 16;
/// Authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// Magic prefix checked on decrypt when strict validation is compiled in.
#[cfg(feature = "validate-encrypted-data")]
pub const SIGNATURE: u32 = 0xaabb_ccdd;
/// Length of the signature prefix.
#[cfg(feature = "validate-encrypted-data")]
pub const SIGNATURE_SIZE: usize = 4;
/// Length of the signature prefix.
#[cfg(not(feature = "validate-encrypted-data"))]
pub const SIGNATURE_SIZE: usize = 0;

/// Bytes added by encryption.
pub const ENCRYPTION_OVERHEAD: usize = SIGNATURE_SIZE + IV_SIZE + TAG_SIZE;

/// SHA-256 digest length.
pub const HASH_LEN: usize = 32;

/// Key sealing key files. Protects against casual disclosure only.
const BOOTSTRAP_KEY: [u8; KEY_SIZE] = [b'A'; KEY_SIZE];

static IV_REFRESH_INTERVAL: AtomicU64 = AtomicU64::new(1 << 20);

struct IvCache {
    base: [u8; IV_SIZE],
    counter: u64,
    seeded: bool,
}

thread_local! {
    static IV_CACHE: RefCell<IvCache> = const {
        RefCell::new(IvCache {
            base: [0u8; IV_SIZE],
            counter: 0,
            seeded: false,
        })
    };
}

/// Sets how many IVs a thread draws from one random base.
pub fn set_iv_refresh_interval(n: u64) {
    IV_REFRESH_INTERVAL.store(n.max(1), Ordering::Relaxed);
}

/// Returns the next IV for this thread.
pub fn next_iv() -> [u8; IV_SIZE] {
    IV_CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        if !cache.seeded || cache.counter >= IV_REFRESH_INTERVAL.load(Ordering::Relaxed) {
            rand::thread_rng().fill_bytes(&mut cache.base);
            cache.counter = 0;
            cache.seeded = true;
        }
        let mut iv = cache.base;
        let mut low = [0u8; 8];
        low.copy_from_slice(&iv[8..]);
        let low = u64::from_le_bytes(low).wrapping_add(cache.counter);
        iv[8..].copy_from_slice(&low.to_le_bytes());
        cache.counter += 1;
        iv
    })
}

/// Size of the envelope produced for `len` plaintext bytes.
pub fn encrypted_size(len: usize) -> usize {
    len + ENCRYPTION_OVERHEAD
}

/// Size of the plaintext inside an envelope of `len` bytes.
pub fn decrypted_size(len: usize) -> Result<usize> {
    len.checked_sub(ENCRYPTION_OVERHEAD).ok_or_else(|| {
        SecurityError::InvalidArgument(format!(
            "encrypted length {len} shorter than overhead {ENCRYPTION_OVERHEAD}"
        ))
    })
}

fn cipher(key: &[u8; KEY_SIZE]) -> Cipher {
    Cipher::new(GenericArray::from_slice(key))
}

fn check_output(needed: usize, available: usize) -> Result<()> {
    if available < needed {
        return Err(SecurityError::InsufficientBuffer { needed, available });
    }
    Ok(())
}

/// Seals `out[body]` in place, where the plaintext has already been copied to
/// `out[ENCRYPTION_OVERHEAD - TAG_SIZE..][..len]`.
fn seal_in_place(key: &[u8; KEY_SIZE], out: &mut [u8], len: usize) -> Result<usize> {
    let total = encrypted_size(len);
    #[cfg(feature = "validate-encrypted-data")]
    out[..SIGNATURE_SIZE].copy_from_slice(&SIGNATURE.to_le_bytes());

    let iv = next_iv();
    let body_start = SIGNATURE_SIZE + IV_SIZE;
    out[SIGNATURE_SIZE..body_start].copy_from_slice(&iv);
    let (body, tag_out) = out[body_start..total].split_at_mut(len);
    let tag = cipher(key)
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), &[], body)
        .map_err(|_| SecurityError::InvalidArgument("plaintext too long".into()))?;
    tag_out.copy_from_slice(&tag);
    Ok(total)
}

/// Encrypts `input` into `out` under a raw key. Returns bytes written.
pub fn encrypt_raw(key: &[u8; KEY_SIZE], input: &[u8], out: &mut [u8]) -> Result<usize> {
    check_output(encrypted_size(input.len()), out.len())?;
    let body_start = SIGNATURE_SIZE + IV_SIZE;
    out[body_start..body_start + input.len()].copy_from_slice(input);
    seal_in_place(key, out, input.len())
}

/// Decrypts the envelope `input` into `out` under a raw key. Returns bytes
/// written. On authentication failure `out` is zeroed.
pub fn decrypt_raw(key: &[u8; KEY_SIZE], input: &[u8], out: &mut [u8]) -> Result<usize> {
    let len = decrypted_size(input.len())?;
    check_output(len, out.len())?;

    #[cfg(feature = "validate-encrypted-data")]
    {
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(&input[..SIGNATURE_SIZE]);
        if u32::from_le_bytes(sig) != SIGNATURE {
            return Err(SecurityError::AuthDecryptFailure);
        }
    }

    let body_start = SIGNATURE_SIZE + IV_SIZE;
    let iv = &input[SIGNATURE_SIZE..body_start];
    let tag = &input[body_start + len..];
    let body = &mut out[..len];
    body.copy_from_slice(&input[body_start..body_start + len]);
    if cipher(key)
        .decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            &[],
            body,
            GenericArray::from_slice(tag),
        )
        .is_err()
    {
        body.fill(0);
        return Err(SecurityError::AuthDecryptFailure);
    }
    Ok(len)
}

/// Encrypts `input` into `out`.
pub fn encrypt(key: &Key, input: &[u8], out: &mut [u8]) -> Result<usize> {
    encrypt_raw(key.as_bytes(), input, out)
}

/// Decrypts `input` into `out`.
pub fn decrypt(key: &Key, input: &[u8], out: &mut [u8]) -> Result<usize> {
    decrypt_raw(key.as_bytes(), input, out)
}

/// Encrypts the concatenation of `inputs` into `out`.
pub fn encrypt_vectored(key: &Key, inputs: &[IoSlice<'_>], out: &mut [u8]) -> Result<usize> {
    let len: usize = inputs.iter().map(|s| s.len()).sum();
    check_output(encrypted_size(len), out.len())?;
    let mut pos = SIGNATURE_SIZE + IV_SIZE;
    for s in inputs {
        out[pos..pos + s.len()].copy_from_slice(s);
        pos += s.len();
    }
    seal_in_place(key.as_bytes(), out, len)
}

/// Decrypts `input` and scatters the plaintext across `outs` in order.
pub fn decrypt_vectored(key: &Key, input: &[u8], outs: &mut [IoSliceMut<'_>]) -> Result<usize> {
    let len = decrypted_size(input.len())?;
    let available: usize = outs.iter().map(|s| s.len()).sum();
    check_output(len, available)?;
    let mut plain = vec![0u8; len];
    decrypt(key, input, &mut plain)?;
    let mut pos = 0;
    for s in outs.iter_mut() {
        if pos == len {
            break;
        }
        let n = s.len().min(len - pos);
        s[..n].copy_from_slice(&plain[pos..pos + n]);
        pos += n;
    }
    Ok(len)
}

/// Encrypts into a new buffer.
pub fn encrypt_to_vec(key: &Key, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; encrypted_size(input.len())];
    encrypt(key, input, &mut out)?;
    Ok(out)
}

/// Decrypts into a new buffer.
pub fn decrypt_to_vec(key: &Key, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; decrypted_size(input.len())?];
    decrypt(key, input, &mut out)?;
    Ok(out)
}

/// Length of the key-file text produced for `data_len` bytes of key data.
pub fn key_file_encoded_len(data_len: usize) -> usize {
    encrypted_size(data_len).div_ceil(3) * 4
}

/// Seals `data` under the bootstrap key and base64-encodes it into `out`.
/// Size `out` with [`key_file_encoded_len`].
pub fn encode_for_key_file(data: &[u8], out: &mut [u8]) -> Result<usize> {
    check_output(key_file_encoded_len(data.len()), out.len())?;
    let mut sealed = vec![0u8; encrypted_size(data.len())];
    encrypt_raw(&BOOTSTRAP_KEY, data, &mut sealed)?;
    STANDARD
        .encode_slice(&sealed, out)
        .map_err(|e| SecurityError::Serialization(e.to_string()))
}

/// Upper bound on the key data inside `encoded_len` bytes of key-file text.
pub fn key_file_decoded_len(encoded_len: usize) -> usize {
    (encoded_len / 4 * 3).saturating_sub(ENCRYPTION_OVERHEAD)
}

/// Reverses [`encode_for_key_file`]. Surrounding whitespace is ignored.
pub fn decode_from_key_file(encoded: &[u8], out: &mut [u8]) -> Result<usize> {
    let sealed = STANDARD.decode(encoded.trim_ascii())?;
    decrypt_raw(&BOOTSTRAP_KEY, &sealed, out)
}

/// Key-file text for `data`.
pub fn encode_key_file_data(data: &[u8]) -> Result<String> {
    let mut out = vec![0u8; key_file_encoded_len(data.len())];
    let n = encode_for_key_file(data, &mut out)?;
    out.truncate(n);
    String::from_utf8(out).map_err(|e| SecurityError::Serialization(e.to_string()))
}

/// Key data inside key-file text.
pub fn decode_key_file_data(encoded: &str) -> Result<Vec<u8>> {
    let mut out = vec![0u8; key_file_decoded_len(encoded.trim().len())];
    let n = decode_from_key_file(encoded.as_bytes(), &mut out)?;
    out.truncate(n);
    Ok(out)
}

/// Random 32-bit number.
pub fn random_number() -> u32 {
    rand::thread_rng().next_u32()
}

/// Fills `buf` with random bytes.
pub fn random_block(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// Fresh random key.
pub fn random_key() -> Key {
    let mut k = [0u8; KEY_SIZE];
    random_block(&mut k);
    Key(k)
}

/// SHA-256 of `data` written to the front of `out`.
pub fn get_hash(data: &[u8], out: &mut [u8]) -> Result<usize> {
    check_output(HASH_LEN, out.len())?;
    let digest = Sha256::digest(data);
    out[..HASH_LEN].copy_from_slice(&digest);
    Ok(HASH_LEN)
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut h = [0u8; HASH_LEN];
    h.copy_from_slice(&Sha256::digest(data));
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn key() -> Key {
        Key([0x42; KEY_SIZE])
    }

    #[test]
    fn test_round_trip_around_block_boundaries() {
        let k = key();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 4096, 4097] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let sealed = encrypt_to_vec(&k, &data).unwrap();
            assert_eq!(sealed.len(), encrypted_size(len));
            assert_eq!(decrypt_to_vec(&k, &sealed).unwrap(), data);
        }
    }

    #[test]
    fn test_short_output_buffers() {
        let k = key();
        let data = [9u8; 40];
        let mut small = vec![0u8; encrypted_size(40) - 1];
        assert!(matches!(
            encrypt(&k, &data, &mut small),
            Err(SecurityError::InsufficientBuffer { needed, available })
                if needed == encrypted_size(40) && available == needed - 1
        ));

        let sealed = encrypt_to_vec(&k, &data).unwrap();
        let mut out = vec![0u8; 39];
        assert!(matches!(
            decrypt(&k, &sealed, &mut out),
            Err(SecurityError::InsufficientBuffer { needed: 40, available: 39 })
        ));
    }

    #[test]
    fn test_tampering_is_detected() {
        let k = key();
        let mut sealed = encrypt_to_vec(&k, b"ticket body").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(
            decrypt_to_vec(&k, &sealed),
            Err(SecurityError::AuthDecryptFailure)
        ));

        let sealed = encrypt_to_vec(&k, b"ticket body").unwrap();
        assert!(matches!(
            decrypt_to_vec(&Key([1; KEY_SIZE]), &sealed),
            Err(SecurityError::AuthDecryptFailure)
        ));
        assert!(decrypt_to_vec(&k, &sealed[..ENCRYPTION_OVERHEAD - 1]).is_err());
    }

    #[test]
    fn test_vectored_matches_contiguous() {
        let k = key();
        let a = b"hello ".to_vec();
        let b = b"vectored ".to_vec();
        let c = b"world".to_vec();
        let mut sealed = vec![0u8; encrypted_size(a.len() + b.len() + c.len())];
        let n = encrypt_vectored(
            &k,
            &[IoSlice::new(&a), IoSlice::new(&b), IoSlice::new(&c)],
            &mut sealed,
        )
        .unwrap();
        assert_eq!(n, sealed.len());

        let mut x = [0u8; 4];
        let mut y = [0u8; 20];
        let got = decrypt_vectored(&k, &sealed, &mut [IoSliceMut::new(&mut x), IoSliceMut::new(&mut y)])
            .unwrap();
        assert_eq!(got, 20);
        assert_eq!(&x, b"hell");
        assert_eq!(&y[..16], b"o vectored world");
    }

    #[test]
    fn test_iv_unique_across_burst_and_reseed() {
        set_iv_refresh_interval(1000);
        let mut seen = HashSet::new();
        for _ in 0..5000 {
            assert!(seen.insert(next_iv()));
        }
        set_iv_refresh_interval(1 << 20);
    }

    #[test]
    fn test_iv_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..2000).map(|_| next_iv()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for iv in h.join().unwrap() {
                assert!(seen.insert(iv));
            }
        }
    }

    #[test]
    fn test_key_file_codec() {
        let data = [0x5au8; 32];
        let mut encoded = vec![0u8; key_file_encoded_len(data.len())];
        let n = encode_for_key_file(&data, &mut encoded).unwrap();
        assert_eq!(n, encoded.len());

        let mut decoded = vec![0u8; key_file_decoded_len(n)];
        let m = decode_from_key_file(&encoded[..n], &mut decoded).unwrap();
        assert_eq!(&decoded[..m], &data);

        let text = encode_key_file_data(b"abc").unwrap();
        assert_eq!(decode_key_file_data(&format!("{text}\n")).unwrap(), b"abc");
        assert!(decode_key_file_data("!!not base64!!").is_err());
    }

    #[test]
    fn test_hash() {
        let mut out = [0u8; 31];
        assert!(matches!(
            get_hash(b"x", &mut out),
            Err(SecurityError::InsufficientBuffer { needed: 32, .. })
        ));
        let mut out = [0u8; 40];
        assert_eq!(get_hash(b"abc", &mut out).unwrap(), HASH_LEN);
        assert_eq!(out[0], 0xba);
        assert_eq!(&out[..32], &sha256(b"abc"));
    }

    proptest! {
        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 0..600)) {
            let k = random_key();
            let sealed = encrypt_to_vec(&k, &data).unwrap();
            prop_assert_eq!(sealed.len(), encrypted_size(data.len()));
            prop_assert_eq!(decrypt_to_vec(&k, &sealed).unwrap(), data);
        }
    }
}
