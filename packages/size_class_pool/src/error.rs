use thiserror::Error;

/// Errors that can occur when requesting memory from a pool registry.
///
/// A failed request never leaves the registry in a partially updated state: after an error,
/// every pool is exactly as it was before the request was made.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The requested size lies outside the range of sizes the size classifier can map to a
    /// block size. The classifier reports zero-byte requests this way, too.
    #[error("request for {bytes} bytes is not supported, the largest supported block is {max_bytes} bytes")]
    SizeUnsupported {
        /// The number of bytes that was requested. Saturates at `usize::MAX` if the byte
        /// count could not even be calculated from the element count.
        bytes: usize,

        /// The largest request the registry can serve.
        max_bytes: usize,
    },

    /// The element type requires a stricter alignment than blocks are guaranteed to have.
    #[error("alignment of {align} bytes is not supported, blocks are only aligned to {max_align} bytes")]
    AlignmentUnsupported {
        /// The alignment required by the element type.
        align: usize,

        /// The alignment every block is guaranteed to satisfy.
        max_align: usize,
    },

    /// The upstream memory provider could not supply a new chunk.
    #[error("upstream provider could not supply a chunk of {chunk_bytes} bytes")]
    ResourceExhausted {
        /// Size of the chunk that was requested from the upstream provider.
        chunk_bytes: usize,
    },
}

/// A specialized `Result` type for pool registry operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);

    #[test]
    fn size_unsupported_mentions_both_sizes() {
        let error = Error::SizeUnsupported {
            bytes: 9000,
            max_bytes: 8192,
        };

        let message = error.to_string();
        assert!(message.contains("9000"));
        assert!(message.contains("8192"));
    }

    #[test]
    fn resource_exhausted_mentions_chunk_size() {
        let error = Error::ResourceExhausted { chunk_bytes: 512 };

        assert!(error.to_string().contains("512"));
    }

    #[test]
    fn alignment_unsupported_mentions_alignments() {
        let error = Error::AlignmentUnsupported {
            align: 32,
            max_align: 8,
        };

        let message = error.to_string();
        assert!(message.contains("32"));
        assert!(message.contains('8'));
    }
}
