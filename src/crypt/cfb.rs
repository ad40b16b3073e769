//! Byte-granular CFB keystream over a block cipher core.
//!
//! Classic full-block cipher feedback: the keystream for each block is the
//! encryption of the previous ciphertext block (the IV for the first), and
//! every byte of plaintext is XORed against it as it passes. The state
//! tracks a position inside the current block, so callers may feed data in
//! arbitrary-length slices and the stream picks up exactly where it left
//! off — which is what a stream wrapper needs, and what the block-granular
//! mode APIs in the ecosystem do not expose.

use super::Block;

/// Largest block size among the supported ciphers.
const MAX_BLOCK: usize = 16;

/// One direction of a CFB stream: either an encryptor or a decryptor,
/// depending on which method is called. The difference is only which side
/// of the XOR feeds the shift register.
pub(crate) struct Cfb {
    block: Block,
    size: usize,
    /// Encrypted register: the keystream for the current block.
    keystream: [u8; MAX_BLOCK],
    /// Ciphertext bytes of the current block, collected as feedback.
    feedback: [u8; MAX_BLOCK],
    pos: usize,
}

impl Cfb {
    pub fn new(block: Block, iv: &[u8]) -> Self {
        let size = block.block_size();
        let mut keystream = [0u8; MAX_BLOCK];
        keystream[..size].copy_from_slice(&iv[..size]);
        block.encrypt_block(&mut keystream[..size]);
        Self {
            block,
            size,
            keystream,
            feedback: [0u8; MAX_BLOCK],
            pos: 0,
        }
    }

    /// XORs plaintext into ciphertext in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            let ciphertext = *byte ^ self.keystream[self.pos];
            *byte = ciphertext;
            self.feedback[self.pos] = ciphertext;
            self.advance();
        }
    }

    /// XORs ciphertext back into plaintext in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            let ciphertext = *byte;
            *byte = ciphertext ^ self.keystream[self.pos];
            self.feedback[self.pos] = ciphertext;
            self.advance();
        }
    }

    fn advance(&mut self) {
        self.pos += 1;
        if self.pos == self.size {
            self.keystream[..self.size].copy_from_slice(&self.feedback[..self.size]);
            self.block.encrypt_block(&mut self.keystream[..self.size]);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::Aes128;
    use cipher::generic_array::GenericArray;
    use cipher::{BlockEncrypt, KeyInit};
    use des::Des;

    fn aes_block() -> Block {
        Block::Aes(Aes128::new_from_slice(&[1u8; 16]).unwrap())
    }

    #[test]
    fn first_block_keystream_is_the_encrypted_iv() {
        let cipher = Aes128::new_from_slice(&[3u8; 16]).unwrap();
        let iv = [5u8; 16];
        let mut expected = GenericArray::clone_from_slice(&iv);
        cipher.encrypt_block(&mut expected);

        let mut enc = Cfb::new(Block::Aes(cipher), &iv);
        let mut data = [0u8; 16];
        enc.encrypt(&mut data);
        assert_eq!(data.as_slice(), expected.as_slice());
    }

    #[test]
    fn round_trips_across_uneven_chunks() {
        let iv = [9u8; 16];
        let mut enc = Cfb::new(aes_block(), &iv);
        let mut dec = Cfb::new(aes_block(), &iv);

        let original: Vec<u8> = (0..=99).collect();
        let mut data = original.clone();
        enc.encrypt(&mut data[..7]);
        enc.encrypt(&mut data[7..23]);
        enc.encrypt(&mut data[23..]);
        assert_ne!(data, original);

        dec.decrypt(&mut data[..31]);
        dec.decrypt(&mut data[31..]);
        assert_eq!(data, original);
    }

    #[test]
    fn chunking_does_not_change_the_stream() {
        let iv = [2u8; 16];
        let mut whole = Cfb::new(aes_block(), &iv);
        let mut pieces = Cfb::new(aes_block(), &iv);

        let mut a = [0x55u8; 40];
        let mut b = a;
        whole.encrypt(&mut a);
        for chunk in b.chunks_mut(3) {
            pieces.encrypt(chunk);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn des_uses_its_own_block_size() {
        let block = Block::Des(Des::new_from_slice(&[4u8; 8]).unwrap());
        let iv = [6u8; 8];
        let mut enc = Cfb::new(block, &iv);
        let block = Block::Des(Des::new_from_slice(&[4u8; 8]).unwrap());
        let mut dec = Cfb::new(block, &iv);

        let mut data = b"small block cipher".to_vec();
        enc.encrypt(&mut data);
        dec.decrypt(&mut data);
        assert_eq!(data, b"small block cipher");
    }
}
