//! File and stdin sources for the initial listing and the watch stream.

use std::path::Path;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use kctlr_store::WatchEvent;

use crate::namespace::{EventLine, Namespace};

/// Read the initial listing: a JSON array of namespaces.
pub async fn read_listing(path: &Path) -> miette::Result<Vec<Namespace>> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| miette::miette!("failed to read listing {}: {}", path.display(), e))?;
    let listing: Vec<Namespace> = serde_json::from_slice(&raw)
        .map_err(|e| miette::miette!("failed to parse listing {}: {}", path.display(), e))?;
    info!(namespaces = listing.len(), path = %path.display(), "loaded initial listing");
    Ok(listing)
}

/// Forward JSON-lines watch events into `tx` until the input ends, the
/// receiver goes away, or `stop` fires. Malformed lines are skipped.
///
/// Returns the number of events forwarded.
pub async fn pump_events<R>(
    reader: R,
    tx: mpsc::Sender<WatchEvent<Namespace>>,
    mut stop: watch::Receiver<bool>,
) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read watch events");
                break;
            }
        };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<EventLine>(trimmed) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed watch event");
                continue;
            }
        };
        let Some(event) = event.into_watch_event() else {
            warn!(line = line_no, "skipping delete event without object or key");
            continue;
        };

        if tx.send(event).await.is_err() {
            debug!("watch receiver closed");
            break;
        }
        forwarded += 1;
    }

    info!(forwarded, "watch event input finished");
    forwarded
}

/// Open the event source: `-` is stdin, anything else a file path.
pub async fn open_events(source: &str) -> miette::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(source)
        .await
        .map_err(|e| miette::miette!("failed to open watch events {}: {}", source, e))?;
    Ok(Box::new(BufReader::new(file)))
}
