//! OCB-AES128 cryptostate for Mumble UDP voice/ping packets.
//!
//! This implements the OCB variant Mumble has used since early versions:
//! AES-128 in ECB mode as the underlying block cipher, nonce sequencing as a
//! 128-bit little-endian-indexed counter (byte 0 increments fastest), and a
//! 256-entry replay table keyed by the nonce's first byte.
//!
//! The algorithm design (OCB) was dedicated to the public domain by its
//! authors; see <https://www.cs.ucdavis.edu/~rogaway/ocb/license.htm>.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;
use thiserror::Error;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 16;

pub type Block = [u8; BLOCK_SIZE];
pub type Key = [u8; KEY_SIZE];

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CryptError {
    #[error("udp datagram shorter than the crypt header")]
    DecryptShort,
    #[error("authentication tag mismatch")]
    DecryptTagMismatch,
    #[error("exact replay of a previously accepted packet")]
    DecryptReplay,
    #[error("counter-cryptanalysis check rejected the packet as forged")]
    DecryptForgery,
}

fn aes_encrypt_block(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&ga);
    out
}

fn aes_decrypt_block(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut ga);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&ga);
    out
}

fn xor_block(a: &Block, b: &Block) -> Block {
    let mut out = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// GF(2^128) doubling under the primitive polynomial `x^128 + x^7 + x^2 + x + 1`
/// (0x87), treating `block` as a big-endian 128-bit integer.
fn gf_double(block: &Block) -> Block {
    let carry = block[0] >> 7;
    let mut out = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE - 1 {
        out[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    out[BLOCK_SIZE - 1] = (block[BLOCK_SIZE - 1] << 1) ^ (carry.wrapping_mul(0x87));
    out
}

/// In-place "2Δ" step.
fn s2(delta: &mut Block) {
    *delta = gf_double(delta);
}

/// In-place "3Δ" step, i.e. `2Δ XOR Δ`.
fn s3(delta: &mut Block) {
    let doubled = gf_double(delta);
    for i in 0..BLOCK_SIZE {
        delta[i] ^= doubled[i];
    }
}

/// Increments `iv` as a 128-bit little-endian counter (byte 0 is the low byte).
fn increment_nonce(iv: &mut Block) {
    for b in iv.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

struct OcbResult {
    ciphertext: Vec<u8>,
    tag: Block,
    forged: bool,
}

/// OCB-AES128 encrypt. `modify_on_xex_star_attack` controls how the
/// second-to-last-block counter-cryptanalysis mitigation behaves: when
/// `true` (the live path) a bit is flipped to avoid producing a
/// distinguishable ciphertext instead of refusing the operation.
fn ocb_encrypt(cipher: &Aes128, plain: &[u8], nonce: &Block, modify_on_xex_star_attack: bool) -> OcbResult {
    let mut delta = aes_encrypt_block(cipher, nonce);
    let mut checksum = [0u8; BLOCK_SIZE];
    let mut ciphertext = Vec::with_capacity(plain.len());
    let mut offset = 0;
    let mut forged = false;

    while plain.len() - offset > BLOCK_SIZE {
        let block: Block = plain[offset..offset + BLOCK_SIZE].try_into().unwrap();

        let mut flip = false;
        if plain.len() - offset - BLOCK_SIZE <= BLOCK_SIZE {
            // Counter-cryptanalysis (eprint.iacr.org/2019/311 sec. 9): the
            // second-to-last block being all-zero except its last byte is the
            // critical XEX* attack pattern.
            let all_zero_but_last = block[..BLOCK_SIZE - 1].iter().all(|&b| b == 0);
            if all_zero_but_last {
                if modify_on_xex_star_attack {
                    flip = true;
                } else {
                    forged = true;
                }
            }
        }

        s2(&mut delta);
        let mut tmp = xor_block(&delta, &block);
        if flip {
            tmp[0] ^= 1;
        }
        tmp = aes_encrypt_block(cipher, &tmp);
        let cipher_block = xor_block(&delta, &tmp);
        ciphertext.extend_from_slice(&cipher_block);

        let mut cs_block = block;
        if flip {
            cs_block[0] ^= 1;
        }
        for i in 0..BLOCK_SIZE {
            checksum[i] ^= cs_block[i];
        }

        offset += BLOCK_SIZE;
    }

    let len = plain.len() - offset;
    s2(&mut delta);
    let mut len_block = [0u8; BLOCK_SIZE];
    len_block[BLOCK_SIZE - 1] = (len * 8) as u8;
    let tmp = xor_block(&len_block, &delta);
    let pad = aes_encrypt_block(cipher, &tmp);

    let mut tmp = [0u8; BLOCK_SIZE];
    tmp[..len].copy_from_slice(&plain[offset..]);
    tmp[len..].copy_from_slice(&pad[len..]);
    for i in 0..BLOCK_SIZE {
        checksum[i] ^= tmp[i];
    }
    let out_block = xor_block(&pad, &tmp);
    ciphertext.extend_from_slice(&out_block[..len]);

    s3(&mut delta);
    let tmp = xor_block(&delta, &checksum);
    let tag = aes_encrypt_block(cipher, &tmp);

    OcbResult { ciphertext, tag, forged }
}

pub struct CryptState {
    raw_key: Key,
    encrypt_iv: Block,
    decrypt_iv: Block,
    decrypt_history: [u8; 256],
    good: u32,
    late: u32,
    lost: u32,
    resync: u32,
}

impl CryptState {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut raw_key = [0u8; KEY_SIZE];
        let mut encrypt_iv = [0u8; BLOCK_SIZE];
        let mut decrypt_iv = [0u8; BLOCK_SIZE];
        rng.fill_bytes(&mut raw_key);
        rng.fill_bytes(&mut encrypt_iv);
        rng.fill_bytes(&mut decrypt_iv);

        CryptState {
            raw_key,
            encrypt_iv,
            decrypt_iv,
            decrypt_history: [0; 256],
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
        }
    }

    pub fn from_parts(raw_key: Key, encrypt_iv: Block, decrypt_iv: Block) -> Self {
        CryptState {
            raw_key,
            encrypt_iv,
            decrypt_iv,
            decrypt_history: [0; 256],
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
        }
    }

    pub fn raw_key(&self) -> &Key {
        &self.raw_key
    }

    pub fn encrypt_iv(&self) -> &Block {
        &self.encrypt_iv
    }

    pub fn decrypt_iv(&self) -> &Block {
        &self.decrypt_iv
    }

    pub fn set_decrypt_iv(&mut self, iv: Block) {
        self.decrypt_iv = iv;
        self.resync += 1;
    }

    pub fn good(&self) -> u32 {
        self.good
    }

    pub fn late(&self) -> u32 {
        self.late
    }

    pub fn lost(&self) -> u32 {
        self.lost
    }

    pub fn resync(&self) -> u32 {
        self.resync
    }

    fn cipher(&self) -> Aes128 {
        Aes128::new(GenericArray::from_slice(&self.raw_key))
    }

    /// Encrypts `plain`, returning the on-wire datagram: `iv0 || tag[0..3] || ciphertext`.
    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        increment_nonce(&mut self.encrypt_iv);

        let cipher = self.cipher();
        let result = ocb_encrypt(&cipher, &cipher, plain, &self.encrypt_iv, true);

        let mut out = Vec::with_capacity(4 + result.ciphertext.len());
        out.push(self.encrypt_iv[0]);
        out.extend_from_slice(&result.tag[..3]);
        out.extend_from_slice(&result.ciphertext);
        out
    }

    /// Decrypts a datagram previously produced by [`CryptState::encrypt`] on
    /// the peer side, applying nonce resynchronization, replay rejection and
    /// the XEX* counter-cryptanalysis check.
    pub fn decrypt(&mut self, datagram: &[u8]) -> Result<Vec<u8>, CryptError> {
        if datagram.len() < 4 {
            return Err(CryptError::DecryptShort);
        }

        let iv0 = datagram[0];
        let tag3 = &datagram[1..4];
        let ciphertext = &datagram[4..];

        let save_iv = self.decrypt_iv;
        let mut restore = false;
        let mut late_delta: i32 = 0;
        let mut lost_delta: i32 = 0;

        if ((self.decrypt_iv[0] as i32 + 1) & 0xFF) == iv0 as i32 {
            match iv0.cmp(&self.decrypt_iv[0]) {
                std::cmp::Ordering::Greater => self.decrypt_iv[0] = iv0,
                std::cmp::Ordering::Less => {
                    self.decrypt_iv[0] = iv0;
                    increment_nonce_from(&mut self.decrypt_iv, 1);
                }
                std::cmp::Ordering::Equal => return Err(CryptError::DecryptReplay),
            }
        } else {
            let mut diff = iv0 as i32 - self.decrypt_iv[0] as i32;
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if iv0 < self.decrypt_iv[0] && diff > -30 && diff < 0 {
                late_delta = 1;
                lost_delta = -1;
                self.decrypt_iv[0] = iv0;
                restore = true;
            } else if iv0 > self.decrypt_iv[0] && diff > -30 && diff < 0 {
                late_delta = 1;
                lost_delta = -1;
                self.decrypt_iv[0] = iv0;
                decrement_nonce_from(&mut self.decrypt_iv, 1);
                restore = true;
            } else if iv0 > self.decrypt_iv[0] && diff > 0 {
                lost_delta = iv0 as i32 - self.decrypt_iv[0] as i32 - 1;
                self.decrypt_iv[0] = iv0;
            } else if iv0 < self.decrypt_iv[0] && diff > 0 {
                lost_delta = 256 - self.decrypt_iv[0] as i32 + iv0 as i32 - 1;
                self.decrypt_iv[0] = iv0;
                increment_nonce_from(&mut self.decrypt_iv, 1);
            } else {
                return Err(CryptError::DecryptReplay);
            }

            if self.decrypt_history[self.decrypt_iv[0] as usize] == self.decrypt_iv[1] {
                self.decrypt_iv = save_iv;
                return Err(CryptError::DecryptReplay);
            }
        }

        let cipher = self.cipher();
        let (plain, tag, forged) = ocb_decrypt_full(&cipher, ciphertext, &self.decrypt_iv);

        if forged || &tag[..3] != tag3 {
            self.decrypt_iv = save_iv;
            return Err(if forged {
                CryptError::DecryptForgery
            } else {
                CryptError::DecryptTagMismatch
            });
        }

        self.decrypt_history[self.decrypt_iv[0] as usize] = self.decrypt_iv[1];

        if restore {
            self.decrypt_iv = save_iv;
        }

        self.good += 1;
        apply_signed_delta(&mut self.late, late_delta);
        apply_signed_delta(&mut self.lost, lost_delta);

        Ok(plain)
    }
}

fn apply_signed_delta(counter: &mut u32, delta: i32) {
    if delta > 0 {
        *counter += delta as u32;
    } else if *counter > (-delta) as u32 {
        *counter -= (-delta) as u32;
    }
}

fn increment_nonce_from(iv: &mut Block, start: usize) {
    for b in iv[start..].iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

fn decrement_nonce_from(iv: &mut Block, start: usize) {
    for b in iv[start..].iter_mut() {
        let (new, _) = b.overflowing_sub(1);
        *b = new;
        if new != 0xFF {
            break;
        }
    }
}

/// Full OCB decrypt (the placeholder loop above is replaced by this
/// self-contained implementation to keep encrypt/decrypt symmetric and
/// independently testable).
fn ocb_decrypt_full(cipher: &Aes128, ciphertext: &[u8], nonce: &Block) -> (Vec<u8>, Block, bool) {
    let mut delta = aes_encrypt_block(cipher, nonce);
    let mut checksum = [0u8; BLOCK_SIZE];
    let mut plain = Vec::with_capacity(ciphertext.len());
    let mut offset = 0;

    while ciphertext.len() - offset > BLOCK_SIZE {
        let block: Block = ciphertext[offset..offset + BLOCK_SIZE].try_into().unwrap();

        s2(&mut delta);
        let tmp = xor_block(&delta, &block);
        let tmp = aes_decrypt_block(cipher, &tmp);
        let plain_block = xor_block(&delta, &tmp);
        plain.extend_from_slice(&plain_block);

        for i in 0..BLOCK_SIZE {
            checksum[i] ^= plain_block[i];
        }

        offset += BLOCK_SIZE;
    }

    let len = ciphertext.len() - offset;
    s2(&mut delta);
    let mut len_block = [0u8; BLOCK_SIZE];
    len_block[BLOCK_SIZE - 1] = (len * 8) as u8;
    let tmp = xor_block(&len_block, &delta);
    let pad = aes_encrypt_block(cipher, &tmp);

    let mut tmp = [0u8; BLOCK_SIZE];
    tmp[..len].copy_from_slice(&ciphertext[offset..]);
    for i in 0..BLOCK_SIZE {
        tmp[i] ^= pad[i];
    }
    for i in 0..BLOCK_SIZE {
        checksum[i] ^= tmp[i];
    }
    plain.extend_from_slice(&tmp[..len]);

    // XEX* counter-cryptanalysis check: a forged packet would decrypt its
    // last short block to exactly `delta XOR len_encoded`.
    let forged = tmp[..BLOCK_SIZE - 1] == delta[..BLOCK_SIZE - 1];

    s3(&mut delta);
    let tag_preimage = xor_block(&delta, &checksum);
    let tag = aes_encrypt_block(cipher, &tag_preimage);

    (plain, tag, forged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let mut tx = CryptState::from_parts([0x11; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
        let mut rx = CryptState::from_parts([0x11; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);

        let plain = b"mumble voice frame payload, arbitrary length";
        let datagram = tx.encrypt(plain);
        let decrypted = rx.decrypt(&datagram).unwrap();

        assert_eq!(decrypted, plain);
        assert_eq!(rx.good(), 1);
    }

    #[test]
    fn roundtrips_at_every_block_boundary_length() {
        // 16 (BLOCK_SIZE) is the one length for which a broken final-block
        // checksum fold (iterating only `0..len` instead of the full 16
        // bytes) happens to be a no-op, since the short-block branch isn't
        // taken at all; these lengths straddle that boundary on both sides.
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 100] {
            let mut tx = CryptState::from_parts([0x77; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
            let mut rx = CryptState::from_parts([0x77; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);

            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let datagram = tx.encrypt(&plain);
            let decrypted = rx.decrypt(&datagram).unwrap_or_else(|e| panic!("len {} failed to decrypt: {:?}", len, e));

            assert_eq!(decrypted, plain, "mismatch at length {}", len);
        }
    }

    #[test]
    fn roundtrips_for_randomized_lengths_and_keys() {
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let mut key = [0u8; KEY_SIZE];
            let mut nonce = [0u8; BLOCK_SIZE];
            rng.fill_bytes(&mut key);
            rng.fill_bytes(&mut nonce);

            let len = (rng.next_u32() % 8192) as usize;
            let mut plain = vec![0u8; len];
            rng.fill_bytes(&mut plain);

            let mut tx = CryptState::from_parts(key, nonce, [0; BLOCK_SIZE]);
            let mut rx = CryptState::from_parts(key, [0; BLOCK_SIZE], nonce);

            let datagram = tx.encrypt(&plain);
            let decrypted = rx.decrypt(&datagram).unwrap_or_else(|e| panic!("len {} failed to decrypt: {:?}", len, e));

            assert_eq!(decrypted, plain);
        }
    }

    #[test]
    fn short_datagram_is_rejected() {
        let mut rx = CryptState::from_parts([0; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
        assert_eq!(rx.decrypt(&[0, 1, 2]), Err(CryptError::DecryptShort));
    }

    #[test]
    fn exact_replay_is_rejected() {
        let mut tx = CryptState::from_parts([0x22; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
        let mut rx = CryptState::from_parts([0x22; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);

        let datagram = tx.encrypt(b"frame one");
        rx.decrypt(&datagram).unwrap();

        // The exact same first-byte/second-byte nonce pair replayed again
        // must be caught by the replay history, not silently re-accepted.
        let second = tx.encrypt(b"frame two");
        rx.decrypt(&second).unwrap();

        assert_eq!(rx.decrypt(&datagram), Err(CryptError::DecryptReplay));
    }

    #[test]
    fn late_packet_is_accepted_and_counted() {
        let mut tx = CryptState::from_parts([0x33; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
        let mut rx = CryptState::from_parts([0x33; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);

        let first = tx.encrypt(b"frame 1");
        let second = tx.encrypt(b"frame 2");

        rx.decrypt(&second).unwrap();
        rx.decrypt(&first).unwrap();

        assert_eq!(rx.good(), 2);
        assert_eq!(rx.late(), 1);
    }

    #[test]
    fn tampered_ciphertext_fails_tag_check() {
        let mut tx = CryptState::from_parts([0x44; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
        let mut rx = CryptState::from_parts([0x44; KEY_SIZE], [0; BLOCK_SIZE], [0; BLOCK_SIZE]);

        let mut datagram = tx.encrypt(b"authenticated payload");
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;

        assert!(rx.decrypt(&datagram).is_err());
    }

    #[test]
    fn known_answer_key_plaintext_nonce_produces_a_20_byte_datagram() {
        let key: Key = core::array::from_fn(|i| i as u8); // 00 01 02 ... 0F
        let plaintext: [u8; 16] = core::array::from_fn(|i| i as u8);
        let nonce: Block = core::array::from_fn(|i| i as u8);

        let mut tx = CryptState::from_parts(key, nonce, [0; BLOCK_SIZE]);
        let first = tx.encrypt(&plaintext);

        assert_eq!(first.len(), 20);
        let first_iv0 = first[0];
        let first_ct = first[4..].to_vec();

        let second = tx.encrypt(&plaintext);
        assert_eq!(second.len(), 20);
        assert_ne!(second[0], first_iv0, "iv0 must advance between successive encrypts");
        assert_ne!(&second[4..], &first_ct[..], "ciphertext must differ once the nonce advances");
    }

    #[test]
    fn late_packet_with_exact_iv_restores_div_after_acceptance() {
        // Drive both sides through one full wrap of the nonce's first byte
        // (distinguishing the low-byte-0x0F/0x10 slots from their previous
        // lap) so the replay-history check doesn't confuse "never seen" with
        // "seen with the same second byte" — then withhold exactly the
        // packet at iv0 = 0x0F and deliver it after div has advanced past
        // 0x10, matching the scenario: div[0] = 0x10, a reordered packet at
        // iv0 = 0x0F is still accepted, counted as late, and div is restored
        // to 0x10 afterward.
        let key = [0x55; KEY_SIZE];
        let mut tx = CryptState::from_parts(key, [0; BLOCK_SIZE], [0; BLOCK_SIZE]);
        let mut rx = CryptState::from_parts(key, [0; BLOCK_SIZE], [0; BLOCK_SIZE]);

        let mut late_datagram = None;
        for i in 1..=272u32 {
            let datagram = tx.encrypt(format!("frame {}", i).as_bytes());
            if i == 271 {
                late_datagram = Some(datagram);
                continue;
            }
            rx.decrypt(&datagram).unwrap();
        }
        let late_datagram = late_datagram.unwrap();

        assert_eq!(late_datagram[0], 0x0F);
        assert_eq!(rx.decrypt_iv[0], 0x10);
        let lost_before = rx.lost();

        let plain = rx.decrypt(&late_datagram).expect("late packet within the window must be accepted");
        assert_eq!(plain, format!("frame {}", 271).as_bytes());
        assert_eq!(rx.late(), 1);
        assert_eq!(rx.lost(), lost_before - 1, "lost must net back out once the late packet lands");
        assert_eq!(rx.decrypt_iv[0], 0x10, "div must be restored after accepting a late packet");
    }

    #[test]
    fn gf_doubling_matches_known_shift_with_reduction() {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0x80; // top bit set, triggers the 0x87 reduction on double
        s2(&mut block);
        assert_eq!(block[BLOCK_SIZE - 1] & 0x87, 0x87 & block[BLOCK_SIZE - 1]);
    }
}
