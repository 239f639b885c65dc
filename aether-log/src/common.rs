//! The seam between pipeline stages, plus small shared helpers.

use std::marker::PhantomData;

/// A stage that receives the bytes another stage produced.
///
/// The write and decode paths are chains of these: the compressor feeds the
/// encryptor, the encryptor feeds the block, the decoder stages feed each
/// other the opposite way. `E` is the error the producing stage can raise;
/// the receiver's own error type must absorb it so `?` composes across the
/// chain.
pub(crate) trait Sink<E> {
    type Error: From<E>;

    /// Hands one span of produced bytes to this stage.
    fn put(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

// A `Vec` terminates a chain by collecting everything; the decoder uses this.
impl<E> Sink<E> for Vec<u8> {
    type Error = E;

    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// A closure acting as a pipeline stage.
///
/// The error type cannot be inferred from the closure alone, hence the
/// explicit parameter.
pub(crate) struct SinkFn<F, E> {
    func: F,
    _error: PhantomData<E>,
}

impl<F, E> SinkFn<F, E> {
    #[inline]
    pub(crate) fn new(func: F) -> Self {
        Self { func, _error: PhantomData }
    }
}

impl<F, E, Err> Sink<E> for SinkFn<F, Err>
where
    F: FnMut(&[u8]) -> Result<(), Err>,
    Err: From<E>,
{
    type Error = Err;

    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        (self.func)(bytes)
    }
}

/// Decodes the hex string to bytes slice.
pub(crate) fn decode_hex(str: &str) -> Option<Vec<u8>> {
    if str.len() % 2 != 0 {
        return None;
    }
    (0..str.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&str[i..i + 2], 16))
        .collect::<Result<Vec<_>, _>>()
        .ok()
}

/// Encodes the bytes slice to a lowercase hex string.
#[cfg(test)]
pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        _ = write!(out, "{byte:02x}");
        out
    })
}
