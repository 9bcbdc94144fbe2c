//! Range Slicer: lazy, bounded-memory reads of a byte range.
//!
//! A read never holds more than one chunk of the source in memory, whatever
//! the size of the requested range. Every read owns its own cursor, so
//! concurrent reads over one source (overlapping or not) are independent.

use bytes::Bytes;
use fibridge_proto::ByteRange;
use futures::stream::{self, BoxStream, StreamExt};
use std::io;

use crate::error::SliceError;
use crate::source::SourceHandle;

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Finite, non-restartable sequence of chunks for one range read.
pub type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

/// A resolved byte span of a source.
///
/// `len` is zero only for a full read of an empty source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub len: u64,
}

impl Span {
    /// Inclusive last byte, `None` for an empty span.
    pub fn end_inclusive(&self) -> Option<u64> {
        self.len.checked_sub(1).map(|last| self.start + last)
    }
}

/// Resolve a requested range against a source of `size` bytes.
pub fn resolve_range(size: u64, range: ByteRange) -> Result<Span, SliceError> {
    let unsatisfiable = |start| SliceError::RangeNotSatisfiable { start, size };

    match range {
        ByteRange::Full => Ok(Span { start: 0, len: size }),
        ByteRange::From { start } => {
            if start >= size {
                return Err(unsatisfiable(start));
            }
            Ok(Span {
                start,
                len: size - start,
            })
        }
        ByteRange::Bounded { start, end } => {
            if start >= size || end < start {
                return Err(unsatisfiable(start));
            }
            let end = end.min(size - 1);
            Ok(Span {
                start,
                len: end - start + 1,
            })
        }
        ByteRange::Suffix { length } => {
            if length == 0 || size == 0 {
                return Err(unsatisfiable(size));
            }
            let len = length.min(size);
            Ok(Span {
                start: size - len,
                len,
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RangeSlicer {
    chunk_size: usize,
}

impl Default for RangeSlicer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl RangeSlicer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read bytes `start..=end` of `source`.
    ///
    /// `end` is clamped to the last byte; `start` beyond the source is
    /// `RangeNotSatisfiable`.
    pub fn read(&self, source: SourceHandle, start: u64, end: u64) -> Result<ChunkStream, SliceError> {
        let span = resolve_range(source.size(), ByteRange::Bounded { start, end })?;
        Ok(self.read_span(source, span))
    }

    /// Lazily read a resolved span.
    ///
    /// A source that comes up short of the span yields `UnexpectedEof`
    /// rather than a silently truncated stream.
    pub fn read_span(&self, source: SourceHandle, span: Span) -> ChunkStream {
        let chunk_size = self.chunk_size as u64;
        let end = span.start + span.len;

        stream::try_unfold(
            (source, span.start),
            move |(source, offset)| async move {
                if offset >= end {
                    return Ok(None);
                }

                let want = (end - offset).min(chunk_size) as usize;
                let bytes = source.read_at(offset, want).await?;
                if bytes.len() != want {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "source {} returned {} of {} bytes at offset {}",
                            source.identity(),
                            bytes.len(),
                            want,
                            offset
                        ),
                    ));
                }

                Ok(Some((bytes, (source, offset + want as u64))))
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use futures::TryStreamExt;

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    async fn collect(stream: ChunkStream) -> Vec<Bytes> {
        stream.try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_concatenated_chunks_reproduce_every_range() {
        let data = pattern(37);
        let source = MemorySource::new(data.clone()).into_handle();
        let slicer = RangeSlicer::new(5);

        for a in 0..data.len() as u64 {
            for b in a..data.len() as u64 {
                let chunks = collect(slicer.read(source.clone(), a, b).unwrap()).await;
                assert!(chunks.iter().all(|c| c.len() <= 5));
                let joined: Vec<u8> = chunks.concat();
                assert_eq!(joined, &data[a as usize..=b as usize], "range {}-{}", a, b);
            }
        }
    }

    #[tokio::test]
    async fn test_end_is_clamped() {
        let source = MemorySource::new(pattern(10)).into_handle();
        let chunks = collect(RangeSlicer::new(4).read(source, 6, 1_000).unwrap()).await;
        assert_eq!(chunks.concat(), pattern(10)[6..].to_vec());
    }

    #[tokio::test]
    async fn test_start_beyond_size_is_unsatisfiable() {
        let source = MemorySource::new(pattern(10)).into_handle();
        assert!(matches!(
            RangeSlicer::default().read(source, 10, 20),
            Err(SliceError::RangeNotSatisfiable { start: 10, size: 10 })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reads_do_not_interfere() {
        let data = pattern(100_000);
        let source = MemorySource::new(data.clone()).into_handle();
        let slicer = RangeSlicer::new(4096);

        let left = collect(slicer.read(source.clone(), 0, 59_999).unwrap());
        let right = collect(slicer.read(source.clone(), 40_000, 99_999).unwrap());
        let (left, right) = tokio::join!(left, right);

        assert_eq!(left.concat(), data[..60_000].to_vec());
        assert_eq!(right.concat(), data[40_000..].to_vec());
    }

    #[test]
    fn test_resolve_range_variants() {
        assert_eq!(
            resolve_range(100, ByteRange::Full).unwrap(),
            Span { start: 0, len: 100 }
        );
        assert_eq!(
            resolve_range(100, ByteRange::From { start: 90 }).unwrap(),
            Span { start: 90, len: 10 }
        );
        assert_eq!(
            resolve_range(100, ByteRange::Bounded { start: 0, end: 999 }).unwrap(),
            Span { start: 0, len: 100 }
        );
        assert_eq!(
            resolve_range(100, ByteRange::Suffix { length: 30 }).unwrap(),
            Span { start: 70, len: 30 }
        );
        assert_eq!(
            resolve_range(100, ByteRange::Suffix { length: 300 }).unwrap(),
            Span { start: 0, len: 100 }
        );
        assert_eq!(
            resolve_range(0, ByteRange::Full).unwrap(),
            Span { start: 0, len: 0 }
        );
    }

    #[test]
    fn test_resolve_range_unsatisfiable() {
        assert!(resolve_range(100, ByteRange::From { start: 100 }).is_err());
        assert!(resolve_range(100, ByteRange::Bounded { start: 5, end: 4 }).is_err());
        assert!(resolve_range(100, ByteRange::Suffix { length: 0 }).is_err());
        assert!(resolve_range(0, ByteRange::Suffix { length: 5 }).is_err());
        assert!(resolve_range(0, ByteRange::Bounded { start: 0, end: 0 }).is_err());
    }

    #[test]
    fn test_span_end_inclusive() {
        assert_eq!(Span { start: 10, len: 5 }.end_inclusive(), Some(14));
        assert_eq!(Span { start: 0, len: 0 }.end_inclusive(), None);
    }

    #[tokio::test]
    async fn test_empty_span_yields_nothing() {
        let source = MemorySource::new(Vec::<u8>::new()).into_handle();
        let chunks = collect(RangeSlicer::default().read_span(source, Span { start: 0, len: 0 })).await;
        assert!(chunks.is_empty());
    }
}
