//! SHA-256 helpers used to verify writes and copies.

use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Running digest shared between a [`HashingReader`] and whoever reads the result.
#[derive(Clone, Default)]
pub struct DigestHandle(Arc<Mutex<(Sha256, u64)>>);

impl DigestHandle {
    /// Hex digest and byte count of everything read so far.
    pub fn finish(&self) -> (String, u64) {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        (hex::encode(guard.0.clone().finalize()), guard.1)
    }
}

/// Reader wrapper that hashes and counts bytes as they pass through.
pub struct HashingReader<R> {
    inner: R,
    digest: DigestHandle,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        let digest = DigestHandle::default();
        (
            Self {
                inner,
                digest: digest.clone(),
            },
            digest,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    let mut guard = this.digest.0.lock().unwrap_or_else(|e| e.into_inner());
                    guard.0.update(fresh);
                    guard.1 += fresh.len() as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
