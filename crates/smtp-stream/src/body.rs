use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct BodyShared {
    bytes: AtomicU64,
    exceeded: AtomicBool,
    complete: AtomicBool,
}

/// Producer half of a body pipe. The connection task pushes unstuffed
/// chunks through it while the data handler reads; the bounded channel
/// is what suspends socket intake when the handler falls behind.
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<BodyShared>,
}

impl BodySender {
    pub async fn send(&self, chunk: Vec<u8>) -> Result<(), ()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(chunk).await.map_err(|_| ())
    }

    /// Mark the body complete, recording the final accounting. Dropping
    /// the sender afterwards is what surfaces EOF to the reader.
    pub fn finish(self, bytes: u64, exceeded: bool) {
        self.shared.bytes.store(bytes, Ordering::Relaxed);
        self.shared.exceeded.store(exceeded, Ordering::Relaxed);
        self.shared.complete.store(true, Ordering::Release);
    }
}

/// The message body as handed to the data handler: an `AsyncRead`
/// over the unstuffed bytes. Byte accounting becomes available once
/// the stream has hit EOF.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Option<(Vec<u8>, usize)>,
    shared: Arc<BodyShared>,
}

impl BodyStream {
    /// Total body length after dot-unstuffing. `None` until EOF.
    pub fn byte_length(&self) -> Option<u64> {
        self.shared
            .complete
            .load(Ordering::Acquire)
            .then(|| self.shared.bytes.load(Ordering::Relaxed))
    }

    /// Whether the body ran past the session's size limit. `None`
    /// until EOF.
    pub fn size_exceeded(&self) -> Option<bool> {
        self.shared
            .complete
            .load(Ordering::Acquire)
            .then(|| self.shared.exceeded.load(Ordering::Relaxed))
    }
}

impl AsyncRead for BodyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some((chunk, pos)) = &mut this.current {
                let n = buf.remaining().min(chunk.len() - *pos);
                buf.put_slice(&chunk[*pos..*pos + n]);
                *pos += n;
                if *pos == chunk.len() {
                    this.current = None;
                }
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    if !chunk.is_empty() {
                        this.current = Some((chunk, 0));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Create a body pipe with the given channel depth.
pub fn body_channel(depth: usize) -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::channel(depth);
    let shared = Arc::new(BodyShared::default());
    (
        BodySender {
            tx,
            shared: shared.clone(),
        },
        BodyStream {
            rx,
            current: None,
            shared,
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn streams_chunks_and_reports_stats() {
        let (tx, mut stream) = body_channel(4);

        assert_eq!(stream.byte_length(), None);

        tx.send(b"hello ".to_vec()).await.unwrap();
        tx.send(b"world".to_vec()).await.unwrap();
        tx.finish(11, false);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(stream.byte_length(), Some(11));
        assert_eq!(stream.size_exceeded(), Some(false));
    }

    #[tokio::test]
    async fn empty_body_is_immediate_eof() {
        let (tx, mut stream) = body_channel(4);
        tx.finish(0, false);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(stream.byte_length(), Some(0));
    }
}
