use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::{LsifError, Result};

/// Byte-counting wrapper around an upload body.
///
/// Fails as soon as the running total passes the declared length or the
/// configured maximum, so an oversized body is never fully read. After the
/// first error the stream ends.
pub struct BoundedStream<S> {
    inner: S,
    declared: Option<u64>,
    max: u64,
    seen: u64,
    failed: bool,
}

impl<S> BoundedStream<S> {
    pub fn new(inner: S, declared: Option<u64>, max: u64) -> Self {
        Self { inner, declared, max, seen: 0, failed: false }
    }

    /// Bytes yielded so far
    pub fn seen(&self) -> u64 {
        self.seen
    }

    fn check(&self) -> Result<()> {
        if let Some(declared) = self.declared {
            if self.seen > declared {
                return Err(LsifError::SizeMismatch { declared, actual: self.seen });
            }
        }
        if self.seen > self.max {
            return Err(LsifError::PayloadTooLarge { size: self.seen, max: self.max });
        }
        Ok(())
    }
}

impl<S, E> Stream for BoundedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.failed {
            return Poll::Ready(None);
        }

        let item = match ready!(self.inner.poll_next_unpin(cx)) {
            None => return Poll::Ready(None),
            Some(Err(err)) => Err(LsifError::storage_error_with_source("read upload body", err)),
            Some(Ok(chunk)) => {
                self.seen += chunk.len() as u64;
                self.check().map(|()| chunk)
            }
        };

        if item.is_err() {
            self.failed = true;
        }
        Poll::Ready(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use pretty_assertions::assert_eq;

    use super::*;

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_passes_body_within_limits() {
        let mut fixture = BoundedStream::new(body(&[b"abc", b"de"]), Some(5), 10);

        let mut actual = Vec::new();
        while let Some(chunk) = fixture.next().await {
            actual.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(actual, b"abcde".to_vec());
        assert_eq!(fixture.seen(), 5);
    }

    #[tokio::test]
    async fn test_rejects_body_longer_than_declared() {
        let mut fixture = BoundedStream::new(body(&[b"abc", b"def", b"ghi"]), Some(4), 100);

        assert!(fixture.next().await.unwrap().is_ok());
        let actual = fixture.next().await.unwrap().unwrap_err();

        assert!(matches!(actual, LsifError::SizeMismatch { declared: 4, actual: 6 }));
        assert!(fixture.next().await.is_none());
    }

    #[tokio::test]
    async fn test_rejects_body_over_max_without_declared_length() {
        let mut fixture = BoundedStream::new(body(&[b"abcdef"]), None, 4);

        let actual = fixture.next().await.unwrap().unwrap_err();

        assert!(matches!(actual, LsifError::PayloadTooLarge { size: 6, max: 4 }));
    }
}
