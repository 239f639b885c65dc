//! Encryption & Decryption.
//!
//! Log payloads are encrypted with `AES 128`. To avoid embedding the symmetric key
//! in the host application, the key is negotiated per block via `ECDH` over the
//! NIST P-256 curve: every block carries a fresh ephemeral public point in its
//! header, and the holder of the secret key can re-derive the block key offline.

use thiserror::Error;

use crate::common::decode_hex;

/// Errors that can be occurred during encryption or decryption.
#[derive(Error, Clone, Debug)]
pub enum Error {
    /// An error that occurs during padding or unpadding.
    #[error("padding error")]
    Padding,
    /// An error that occurs during ECDH.
    #[error("ECDH error")]
    Ecdh,
}

/// Errors that can be occurred during encryption.
pub type EncryptionError = Error;

/// Errors that can be occurred during decryption.
pub type DecryptionError = Error;

/// An encryption key string that could not be interpreted.
#[derive(Error, Clone, Debug)]
pub enum KeyError {
    /// The key is not a well-formed hex string of the right length.
    #[error("the key is not a hex string of {expected} bytes")]
    Hex {
        /// The expected decoded length.
        expected: usize,
    },
    /// The key does not name a point on the curve.
    #[error("the key is not a valid curve point")]
    Point,
}

/// Represents the type of encryption keys.
///
/// Block payloads are encrypted with keys of length 16 bytes (128 bits).
pub type EncryptionKey = [u8; 16];

/// Represents the length of the public key.
///
/// A public key is a compressed elliptic curve point.
/// With length: 1 byte (encoding tag) + 32 bytes (256 bits).
pub const PUBLIC_KEY_LEN: usize = 33;

/// Operation of encryption. Different values are used according to different flush
/// dimensions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum EncryptOp<'a> {
    Input(&'a [u8]),
    Flush,
}

/// Represents a block encryptor that encrypts data to its target (`Sink`).
pub(crate) trait Encryptor {
    fn encrypt<S>(&mut self, operation: EncryptOp, sink: &mut S) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>;
}

/// Represents a block decryptor that decrypts data to its target (`Sink`).
pub(crate) trait Decryptor {
    fn decrypt<S>(
        &mut self,
        input: &[u8],
        reached_to_end: bool,
        sink: &mut S,
    ) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>;
}

pub use ecdh::{gen_key_pair, PublicKey, SecretKey};

/// `Elliptic Curve Diffie-Hellman (ECDH)` Support.
///
/// Using the NIST P-256 (a.k.a. secp256r1, prime256v1) elliptic curve.
pub(crate) mod ecdh {
    use std::mem;

    use p256::{ecdh::diffie_hellman, elliptic_curve};
    use rand_core::OsRng;

    use crate::encrypt::{EncryptionKey, Error, KeyError, PUBLIC_KEY_LEN};

    /// Represents the type of secret keys.
    ///
    /// With length: 32 bytes (256 bits).
    pub type SecretKey = [u8; 32];

    /// Represents the type of public keys.
    ///
    /// A public key is a compressed elliptic curve point.
    /// With length: 1 byte (encoding tag) + 32 bytes (256 bits).
    pub type PublicKey = [u8; 33];

    /// The empty public key, it means no encryption.
    pub(crate) const EMPTY_PUBLIC_KEY: PublicKey = [0; PUBLIC_KEY_LEN];

    impl From<elliptic_curve::Error> for Error {
        #[inline]
        fn from(_: elliptic_curve::Error) -> Self {
            Self::Ecdh
        }
    }

    /// Generates an ECDH key pair.
    ///
    /// The public key configures the engine; the secret key stays with whoever
    /// decodes the log files.
    #[inline]
    pub fn gen_key_pair() -> (SecretKey, PublicKey) {
        let secret_key = p256::SecretKey::random(&mut OsRng);
        let public_key = p256::EncodedPoint::from(secret_key.public_key()).compress();
        (secret_key.to_bytes().into(), public_key.as_bytes().try_into().unwrap())
    }

    /// Parses a hex-encoded compressed public key.
    pub(crate) fn public_key_from_hex(hex: &str) -> Result<PublicKey, KeyError> {
        let bytes = crate::common::decode_hex(hex)
            .and_then(|bytes| PublicKey::try_from(bytes).ok())
            .ok_or(KeyError::Hex { expected: PUBLIC_KEY_LEN })?;
        // Fails fast on a key the per-block negotiation could never use.
        p256::PublicKey::from_sec1_bytes(&bytes).map_err(|_| KeyError::Point)?;
        Ok(bytes)
    }

    /// Represents the public and symmetric keys generated when a block starts.
    pub(crate) struct Keys {
        /// Represents the ephemeral public key stored in the block header.
        pub(crate) public_key: PublicKey,
        /// Represents the symmetric key during block payload encryption.
        pub(crate) encryption_key: EncryptionKey,
    }

    impl Keys {
        /// Constructs the `Keys` via Elliptic Curve Diffie-Hellman (ECDH).
        pub(crate) fn new(public_key: &PublicKey) -> Result<Self, Error> {
            let public_key = p256::PublicKey::from_sec1_bytes(public_key.as_ref())?;
            let secret_key = p256::SecretKey::random(&mut OsRng);

            let encryption_key =
                diffie_hellman(secret_key.to_nonzero_scalar(), public_key.as_affine());
            let encryption_key = encryption_key.raw_secret_bytes().as_slice()
                [..mem::size_of::<EncryptionKey>()]
                .try_into()
                .map_err(|_| Error::Ecdh)?;

            let public_key = p256::EncodedPoint::from(secret_key.public_key()).compress();
            let public_key = public_key.as_bytes().try_into().map_err(|_| Error::Ecdh)?;

            Ok(Self { public_key, encryption_key })
        }
    }

    /// Re-derives the symmetric key of a block from the decoder side.
    #[inline]
    pub(crate) fn ecdh_encryption_key(
        secret_key: &SecretKey,
        public_key: &PublicKey,
    ) -> Result<EncryptionKey, Error> {
        let secret_key = p256::SecretKey::from_slice(secret_key.as_ref())?;
        let public_key = p256::PublicKey::from_sec1_bytes(public_key.as_ref())?;

        let encryption_key = diffie_hellman(secret_key.to_nonzero_scalar(), public_key.as_affine());
        encryption_key.raw_secret_bytes().as_slice()[..mem::size_of::<EncryptionKey>()]
            .try_into()
            .map_err(|_| Error::Ecdh)
    }
}

/// Parses a hex-encoded secret key, the decoder-side half of the key pair.
pub(crate) fn secret_key_from_hex(hex: &str) -> Result<SecretKey, KeyError> {
    decode_hex(hex)
        .and_then(|bytes| SecretKey::try_from(bytes).ok())
        .ok_or(KeyError::Hex { expected: std::mem::size_of::<SecretKey>() })
}

pub(crate) use aes_impl::{Decryptor as AesDecryptor, Encryptor as AesEncryptor};

/// `AES 128` in ECB mode with a PKCS#7 seal.
///
/// Payloads are deflate-compressed before they reach the cipher, and every
/// block of the log is keyed independently, so a cipher instance only ever
/// sees one block's worth of compressed bytes.
pub(crate) mod aes_impl {
    use aes::{Aes128Dec, Aes128Enc};
    use cipher::{
        block_padding::{NoPadding, Pkcs7, UnpadError},
        inout::PadError,
        BlockDecrypt, BlockEncrypt, KeyInit,
    };

    use crate::{
        encrypt::{
            Decryptor as DecryptorTrait, EncryptOp, EncryptionKey, Encryptor as EncryptorTrait,
            Error,
        },
        Sink,
    };

    /// 128-bit AES block.
    const BLOCK_SIZE: usize = 16;

    impl From<PadError> for Error {
        #[inline]
        fn from(_: PadError) -> Self {
            Self::Padding
        }
    }

    impl From<UnpadError> for Error {
        #[inline]
        fn from(_: UnpadError) -> Self {
            Self::Padding
        }
    }

    /// Bytes waiting for a whole cipher block to accumulate.
    ///
    /// The cipher is only ever run over multiples of [`BLOCK_SIZE`]; whatever
    /// remains stays staged until more input arrives or the log block is
    /// sealed.
    struct StagingBuf {
        buf: Box<[u8]>,
        len: usize,
    }

    impl StagingBuf {
        fn new(capacity: usize) -> Self {
            debug_assert!(capacity >= BLOCK_SIZE, "staging smaller than a cipher block");
            Self { buf: vec![0; capacity].into_boxed_slice(), len: 0 }
        }

        /// Copies in as much of `input` as fits, returning how much was taken.
        fn fill(&mut self, input: &[u8]) -> usize {
            let taken = input.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + taken].copy_from_slice(&input[..taken]);
            self.len += taken;
            taken
        }

        /// Runs `apply` over the staged bytes in place (all of them when `all`,
        /// otherwise the whole cipher blocks only), forwards its output to the
        /// sink, and keeps the unprocessed tail staged.
        fn crunch<S, E>(
            &mut self,
            sink: &mut S,
            all: bool,
            apply: impl FnOnce(&mut [u8], usize) -> Result<&[u8], E>,
        ) -> Result<(), S::Error>
        where
            S: Sink<Error>,
            E: Into<Error>,
        {
            let ready = if all { self.len } else { self.len / BLOCK_SIZE * BLOCK_SIZE };

            let out = apply(&mut self.buf, ready).map_err(Into::into)?;
            if !out.is_empty() {
                sink.put(out)?;
            }

            self.buf.copy_within(ready..self.len, 0);
            self.len -= ready;
            Ok(())
        }
    }

    /// Streams one log block's payload through `AES 128`.
    ///
    /// An encryptor lives exactly as long as its block: the buffer constructs
    /// one from the freshly negotiated key at every block reset. Mid-stream
    /// input passes through as bare whole cipher blocks, and the rotation
    /// flush seals the stream with PKCS#7. A block whose seal was never
    /// written (the process died first) still decrypts up to its last whole
    /// cipher block.
    pub(crate) struct Encryptor {
        inner: Aes128Enc,
        staging: StagingBuf,
    }

    impl Encryptor {
        /// Staged bytes between drains; a few cipher blocks of slack is plenty
        /// for one formatted record.
        const STAGING_LEN: usize = 16 * BLOCK_SIZE;

        /// Constructs a new `Encryptor` with one block's negotiated key.
        #[inline]
        pub(crate) fn new(key: &EncryptionKey) -> Self {
            let inner = Aes128Enc::new(key.into());
            Self { inner, staging: StagingBuf::new(Self::STAGING_LEN) }
        }
    }

    impl EncryptorTrait for Encryptor {
        fn encrypt<S>(&mut self, operation: EncryptOp, sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink<Error>,
        {
            match operation {
                EncryptOp::Input(mut input) => {
                    while !input.is_empty() {
                        let taken = self.staging.fill(input);
                        self.staging.crunch(sink, false, |buf, len| {
                            self.inner.encrypt_padded::<NoPadding>(buf, len)
                        })?;
                        input = &input[taken..];
                    }
                    Ok(())
                }
                EncryptOp::Flush => self
                    .staging
                    .crunch(sink, true, |buf, len| self.inner.encrypt_padded::<Pkcs7>(buf, len)),
            }
        }
    }

    /// Reverses [`Encryptor`] over one block's payload.
    ///
    /// `reached_to_end` marks the payload's final bytes: a sealed block strips
    /// its PKCS#7 tail there, while writeback and crash-truncated blocks
    /// (which never got a seal) decrypt as bare whole cipher blocks.
    pub(crate) struct Decryptor {
        inner: Aes128Dec,
        staging: StagingBuf,
    }

    impl Decryptor {
        /// Staged bytes between drains; decoding reads in coarser strides than
        /// logging writes.
        const STAGING_LEN: usize = 64 * BLOCK_SIZE;

        /// Constructs a new `Decryptor` with one block's re-derived key.
        #[inline]
        pub(crate) fn new(key: &EncryptionKey) -> Self {
            let inner = Aes128Dec::new(key.into());
            Self { inner, staging: StagingBuf::new(Self::STAGING_LEN) }
        }
    }

    impl DecryptorTrait for Decryptor {
        fn decrypt<S>(
            &mut self,
            mut input: &[u8],
            reached_to_end: bool,
            sink: &mut S,
        ) -> Result<(), S::Error>
        where
            S: Sink<Error>,
        {
            while !input.is_empty() {
                let taken = self.staging.fill(input);

                let last = reached_to_end && taken == input.len();
                self.staging.crunch(sink, last, |buf, len| {
                    let buf = &mut buf[..len];
                    if last {
                        self.inner.decrypt_padded::<Pkcs7>(buf)
                    } else {
                        self.inner.decrypt_padded::<NoPadding>(buf)
                    }
                })?;

                input = &input[taken..];
            }
            Ok(())
        }
    }
}

impl<T> Encryptor for Option<T>
where
    T: Encryptor,
{
    #[inline]
    fn encrypt<S>(&mut self, operation: EncryptOp, sink: &mut S) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>,
    {
        match self {
            Some(encryptor) => encryptor.encrypt(operation, sink),
            // Just writes its all input to the sink directly.
            None => match operation {
                EncryptOp::Input(bytes) => sink.put(bytes),
                _ => Ok(()),
            },
        }
    }
}

impl<T> Decryptor for Option<T>
where
    T: Decryptor,
{
    #[inline]
    fn decrypt<S>(
        &mut self,
        input: &[u8],
        reached_to_end: bool,
        sink: &mut S,
    ) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>,
    {
        match self {
            Some(decryptor) => decryptor.decrypt(input, reached_to_end, sink),
            // Just writes its all input to the sink directly.
            None => sink.put(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use crate::{
        common::encode_hex,
        encrypt::{
            ecdh, gen_key_pair, secret_key_from_hex, AesDecryptor, AesEncryptor, Decryptor,
            EncryptOp, EncryptionKey, Encryptor,
        },
    };

    const KEY: EncryptionKey = [0x23; 16];

    fn aes_encrypt(input: &[u8]) -> Vec<u8> {
        let mut encryptor = AesEncryptor::new(&KEY);
        let mut sink = Vec::new();
        let mut sink_mul = Vec::new();

        // One time.
        encryptor.encrypt(EncryptOp::Input(input), &mut sink).unwrap();
        encryptor.encrypt(EncryptOp::Flush, &mut sink).unwrap();

        // Multiple times.
        for byte in input {
            encryptor.encrypt(EncryptOp::Input(slice::from_ref(byte)), &mut sink_mul).unwrap();
        }
        encryptor.encrypt(EncryptOp::Flush, &mut sink_mul).unwrap();

        assert_eq!(sink, sink_mul);
        sink
    }

    fn aes_decrypt(input: &[u8]) -> Vec<u8> {
        let mut decryptor = AesDecryptor::new(&KEY);
        let mut sink = Vec::new();
        decryptor.decrypt(input, true, &mut sink).unwrap();
        sink
    }

    #[test]
    fn test_aes() {
        // Short data
        let data = b"Hello World";
        assert_eq!(aes_decrypt(&aes_encrypt(data)), data);

        // 16 bytes data
        let data = b"123456789ABCDEFG";
        assert_eq!(aes_decrypt(&aes_encrypt(data)), data);

        // Long data
        let data = b"a somewhat longer payload that spans several AES blocks.";
        assert_eq!(aes_decrypt(&aes_encrypt(data)), data);
    }

    #[test]
    fn test_whole_blocks_only() {
        let mut encryptor = AesEncryptor::new(&KEY);
        let mut sink = Vec::new();

        // A partial cipher block stays staged.
        encryptor.encrypt(EncryptOp::Input(&[1; 5]), &mut sink).unwrap();
        assert!(sink.is_empty());

        // Completing the block releases exactly one.
        encryptor.encrypt(EncryptOp::Input(&[2; 11]), &mut sink).unwrap();
        assert_eq!(sink.len(), 16);

        // The seal emits the final padded block.
        encryptor.encrypt(EncryptOp::Flush, &mut sink).unwrap();
        assert_eq!(sink.len(), 32);
    }

    #[test]
    fn test_key_negotiation() {
        let (secret_key, public_key) = gen_key_pair();

        let keys = ecdh::Keys::new(&public_key).unwrap();
        let rederived = ecdh::ecdh_encryption_key(&secret_key, &keys.public_key).unwrap();
        assert_eq!(keys.encryption_key, rederived);
    }

    #[test]
    fn test_hex_keys() {
        let (secret_key, public_key) = gen_key_pair();

        let parsed = ecdh::public_key_from_hex(&encode_hex(&public_key)).unwrap();
        assert_eq!(parsed, public_key);
        assert!(ecdh::public_key_from_hex("0011").is_err());

        let parsed = secret_key_from_hex(&encode_hex(&secret_key)).unwrap();
        assert_eq!(parsed, secret_key);
    }
}
