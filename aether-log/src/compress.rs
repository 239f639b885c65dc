//! Compression & Decompression.
//!
//! The block payload carries a raw deflate stream: every logical write is
//! sync-flushed so that each framed item stays decodable on its own, and the
//! stream is finished when the block rotates.

use thiserror::Error;

/// Errors that can be occurred during compression or decompression.
#[derive(Error, Clone, Debug)]
#[error("{message}")]
pub struct Error {
    /// Represents an error descriptive message from the underlying deflate library.
    message: String,
}

/// Errors that can be occurred during compression.
pub type CompressionError = Error;

/// Errors that can be occurred during decompression.
pub type DecompressionError = Error;

/// Operation of compression. Different values are used according to different flush
/// dimensions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CompressOp<'a> {
    Input(&'a [u8]),
    Flush,
    End,
}

/// Represents a compressor that compresses data to its target (`Sink`).
pub(crate) trait Compressor {
    fn compress<S>(&mut self, operation: CompressOp, sink: &mut S) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>;

    /// Rearms the compressor for a fresh stream.
    fn reset(&mut self);
}

/// Represents a decompressor that decompresses data to its target (`Sink`).
pub(crate) trait Decompressor {
    fn decompress<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>;
}

/// The worst-case deflate output length for `len` input bytes, mirroring zlib's
/// `deflateBound`.
pub(crate) fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

pub(crate) use deflate::{Compressor as DeflateCompressor, Decompressor as DeflateDecompressor};

/// `Compressor` and `Decompressor` for the raw `deflate` stream format.
pub(crate) mod deflate {
    use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

    use crate::{
        compress::{
            CompressOp, Compressor as CompressorTrait, Decompressor as DecompressorTrait, Error,
        },
        Sink,
    };

    impl From<flate2::CompressError> for Error {
        #[inline]
        fn from(error: flate2::CompressError) -> Self {
            Self { message: error.to_string() }
        }
    }

    impl From<flate2::DecompressError> for Error {
        #[inline]
        fn from(error: flate2::DecompressError) -> Self {
            Self { message: error.to_string() }
        }
    }

    /// The raw-deflate compressor.
    pub(crate) struct Compressor {
        context: Compress,
        output_buffer: Vec<u8>,
    }

    impl Compressor {
        /// Length of `output buffer`.
        ///
        /// An output buffer of 256 bytes should be sufficient for compression of a
        /// log.
        const BUFFER_LEN: usize = 256;

        /// Constructs a new `Compressor`.
        #[inline]
        pub(crate) fn new() -> Self {
            Self {
                context: Compress::new(Compression::default(), false),
                output_buffer: Vec::with_capacity(Self::BUFFER_LEN),
            }
        }
    }

    impl CompressorTrait for Compressor {
        fn compress<S>(&mut self, operation: CompressOp, sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink<Error>,
        {
            let (mut input, flush) = match operation {
                CompressOp::Input(bytes) => (bytes, FlushCompress::None),
                CompressOp::Flush => (&[] as &[u8], FlushCompress::Sync),
                CompressOp::End => (&[] as &[u8], FlushCompress::Finish),
            };

            loop {
                self.output_buffer.clear();
                let before_in = self.context.total_in();
                let status =
                    self.context.compress_vec(input, &mut self.output_buffer, flush).map_err(
                        Error::from,
                    )?;
                let consumed = (self.context.total_in() - before_in) as usize;
                input = &input[consumed..];

                if !self.output_buffer.is_empty() {
                    sink.put(&self.output_buffer)?;
                }

                // For `Input` we're finished once all the input has been consumed. A sync
                // flush is complete when the output buffer was not filled to the brim, and
                // a finish when the stream reports its end.
                let finished = match flush {
                    FlushCompress::None => input.is_empty(),
                    FlushCompress::Sync => self.output_buffer.len() < Self::BUFFER_LEN,
                    _ => status == Status::StreamEnd,
                };
                if finished {
                    break Ok(());
                }
            }
        }

        #[inline]
        fn reset(&mut self) {
            self.context.reset();
        }
    }

    /// The raw-deflate decompressor.
    pub(crate) struct Decompressor {
        context: Decompress,
        output_buffer: Vec<u8>,
    }

    impl Decompressor {
        /// Length of `output buffer`.
        ///
        /// Uses 1KB as the output buffer length for decompression.
        const BUFFER_LEN: usize = 1024;

        /// Constructs a new `Decompressor`.
        #[inline]
        pub(crate) fn new() -> Self {
            Self {
                context: Decompress::new(false),
                output_buffer: Vec::with_capacity(Self::BUFFER_LEN),
            }
        }
    }

    impl DecompressorTrait for Decompressor {
        fn decompress<S>(&mut self, mut input: &[u8], sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink<Error>,
        {
            loop {
                self.output_buffer.clear();
                let before_in = self.context.total_in();
                let status = self
                    .context
                    .decompress_vec(input, &mut self.output_buffer, FlushDecompress::None)
                    .map_err(Error::from)?;
                let consumed = (self.context.total_in() - before_in) as usize;
                input = &input[consumed..];

                if !self.output_buffer.is_empty() {
                    sink.put(&self.output_buffer)?;
                }

                // A truncated tail (crash leftovers) simply stops producing output; the
                // bytes decoded so far are the recoverable prefix.
                let drained = input.is_empty() && self.output_buffer.len() < Self::BUFFER_LEN;
                if status == Status::StreamEnd || status == Status::BufError || drained {
                    break Ok(());
                }
            }
        }
    }

    impl Default for Decompressor {
        #[inline]
        fn default() -> Self {
            Self::new()
        }
    }
}

impl<T> Compressor for Option<T>
where
    T: Compressor,
{
    #[inline]
    fn compress<S>(&mut self, operation: CompressOp, sink: &mut S) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>,
    {
        match self {
            Some(compressor) => compressor.compress(operation, sink),
            // Just writes its all input to the sink directly.
            None => match operation {
                CompressOp::Input(bytes) => sink.put(bytes),
                _ => Ok(()),
            },
        }
    }

    #[inline]
    fn reset(&mut self) {
        if let Some(compressor) = self {
            compressor.reset();
        }
    }
}

impl<T> Decompressor for Option<T>
where
    T: Decompressor,
{
    #[inline]
    fn decompress<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: crate::Sink<Error>,
    {
        match self {
            Some(decompressor) => decompressor.decompress(input, sink),
            // Just writes its all input to the sink directly.
            None => sink.put(input),
        }
    }
}
