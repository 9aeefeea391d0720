use std::io;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

pub(super) enum WalCommand {
    /// Events that must become durable together (one commit).
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Hold the writer idle, standing in for a slow disk.
    #[cfg(test)]
    Stall { delay: std::time::Duration },
}

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to every sender with the batch result.
pub(super) async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch: Vec<Pending> = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other).await;
                }
            }
            other => handle_non_append(&mut wal, other).await,
        }
    }
}

fn flush_and_respond(wal: &mut Wal, mut batch: Vec<Pending>) {
    let size: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(size as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {size} events failed: {e}");
    }

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch; every caller in this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

async fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            flush_and_respond(wal, vec![(events, response)]);
        }
        #[cfg(test)]
        WalCommand::Stall { delay } => tokio::time::sleep(delay).await,
    }
}
