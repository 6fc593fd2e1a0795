use bytes::Bytes;
use tokio::sync::mpsc;

/// Chunks buffered per sink. Bounded so a tee holds O(1) memory no matter
/// how large the object is; a slow consumer applies backpressure instead of
/// growing a queue.
const FANOUT_DEPTH: usize = 8;

pub type Chunk = Result<Bytes, std::io::Error>;

struct Sink {
    label: &'static str,
    tx: mpsc::Sender<Chunk>,
    failed: bool,
}

/// Fan-out writer for the tee pipeline: one reader pushes every chunk to an
/// ordered list of sinks. A sink whose receiver went away is marked failed
/// and skipped; the remaining sinks keep receiving. Dropping the fanout
/// closes all channels, which the consumers observe as end of stream.
#[derive(Default)]
pub struct ChunkFanout {
    sinks: Vec<Sink>,
}

impl ChunkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, label: &'static str) -> mpsc::Receiver<Chunk> {
        let (tx, rx) = mpsc::channel(FANOUT_DEPTH);
        self.sinks.push(Sink {
            label,
            tx,
            failed: false,
        });
        rx
    }

    /// Deliver one chunk to every live sink. Returns `false` once no sink is
    /// left to deliver to, so the reader can stop pulling from the source.
    pub async fn push(&mut self, chunk: Bytes) -> bool {
        for sink in self.sinks.iter_mut().filter(|sink| !sink.failed) {
            if sink.tx.send(Ok(chunk.clone())).await.is_err() {
                tracing::debug!(sink = sink.label, "tee sink went away");
                sink.failed = true;
            }
        }
        self.live_sinks() > 0
    }

    /// Forward a terminal source error to every live sink.
    pub async fn fail(&mut self, error: std::io::Error) {
        let message = error.to_string();
        for sink in self.sinks.iter_mut().filter(|sink| !sink.failed) {
            let _ = sink.tx.send(Err(std::io::Error::other(message.clone()))).await;
            sink.failed = true;
        }
    }

    pub fn live_sinks(&self) -> usize {
        self.sinks.iter().filter(|sink| !sink.failed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkFanout;
    use bytes::Bytes;

    #[tokio::test]
    async fn push_delivers_chunks_in_order_to_all_sinks() {
        let mut fanout = ChunkFanout::new();
        let mut first = fanout.add_sink("first");
        let mut second = fanout.add_sink("second");

        assert!(fanout.push(Bytes::from_static(b"one")).await);
        assert!(fanout.push(Bytes::from_static(b"two")).await);
        drop(fanout);

        for rx in [&mut first, &mut second] {
            let chunk = rx.recv().await.expect("chunk").expect("ok");
            assert_eq!(chunk.as_ref(), b"one");
            let chunk = rx.recv().await.expect("chunk").expect("ok");
            assert_eq!(chunk.as_ref(), b"two");
            assert!(rx.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn dropped_sink_does_not_stop_delivery() {
        let mut fanout = ChunkFanout::new();
        let first = fanout.add_sink("first");
        let mut second = fanout.add_sink("second");
        drop(first);

        assert!(fanout.push(Bytes::from_static(b"chunk")).await);
        assert_eq!(fanout.live_sinks(), 1);

        let chunk = second.recv().await.expect("chunk").expect("ok");
        assert_eq!(chunk.as_ref(), b"chunk");
    }

    #[tokio::test]
    async fn push_reports_when_no_sink_is_left() {
        let mut fanout = ChunkFanout::new();
        let first = fanout.add_sink("first");
        let second = fanout.add_sink("second");
        drop(first);
        drop(second);

        assert!(!fanout.push(Bytes::from_static(b"chunk")).await);
        assert_eq!(fanout.live_sinks(), 0);
    }

    #[tokio::test]
    async fn fail_forwards_error_to_live_sinks() {
        let mut fanout = ChunkFanout::new();
        let mut first = fanout.add_sink("first");
        let mut second = fanout.add_sink("second");

        assert!(fanout.push(Bytes::from_static(b"chunk")).await);
        fanout
            .fail(std::io::Error::other("source read failed"))
            .await;
        assert_eq!(fanout.live_sinks(), 0);

        for rx in [&mut first, &mut second] {
            let _ = rx.recv().await.expect("chunk").expect("ok");
            let err = rx.recv().await.expect("chunk").expect_err("error");
            assert!(err.to_string().contains("source read failed"));
        }
    }

    #[tokio::test]
    async fn empty_fanout_has_no_live_sinks() {
        let mut fanout = ChunkFanout::new();
        assert_eq!(fanout.live_sinks(), 0);
        assert!(!fanout.push(Bytes::from_static(b"chunk")).await);
    }
}
