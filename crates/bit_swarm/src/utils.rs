use rand::{distributions::Alphanumeric, Rng};
use tracing::{error, trace, Instrument};

pub const PEER_ID_PREFIX: &[u8; 8] = b"-BS0001-";

pub fn check_integrity(hash: &[u8], buf: &[u8]) -> bool {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(buf);
    let result = hasher.digest().bytes();
    result == hash
}

pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    let rng = rand::thread_rng();
    for (slot, byte) in peer_id[8..].iter_mut().zip(rng.sample_iter(Alphanumeric)) {
        *slot = byte;
    }
    peer_id
}

/// Spawns a future with tracing instrumentation.
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!("started");
        tokio::pin!(fut);
        let mut trace_interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = trace_interval.tick() => {
                    trace!("still running");
                },
                r = &mut fut => {
                    match r {
                        Ok(_) => {
                            trace!("finished");
                        }
                        Err(e) => {
                            error!("finished with error: {:#}", e)
                        }
                    }
                    return;
                }
            }
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}
