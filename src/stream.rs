//! Transport framing for the progress stream.
//!
//! The pipeline never touches a socket or stdout. It writes into a
//! [`ProgressEmitter`](crate::progress::ProgressEmitter); one drain task
//! turns the [`EventStream`] into line-delimited JSON on any `AsyncWrite`
//! (an HTTP response body, a file, stdout).

use crate::progress::ProgressEvent;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Serialise one event as a single NDJSON line (with trailing `\n`).
pub fn to_ndjson_line(event: &ProgressEvent) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Drain `events` (usually an [`EventStream`](crate::progress::EventStream)) into `writer`, one JSON object per line, flushing after
/// each line so consumers see progress live.
///
/// Returns the number of events written. Ends when the emitter finishes.
pub async fn write_ndjson<S, W>(mut events: S, mut writer: W) -> std::io::Result<usize>
where
    S: Stream<Item = ProgressEvent> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    while let Some(event) = events.next().await {
        let line = to_ndjson_line(&event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        written += 1;
    }
    debug!("progress stream closed after {} events", written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressEmitter, Terminal};

    #[tokio::test]
    async fn writes_one_line_per_event() {
        let (emitter, events) = ProgressEmitter::channel(4);
        let drain = tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let n = write_ndjson(events, &mut buf).await.unwrap();
            (n, buf)
        });

        emitter.step("uploading", 5, "Uploading document").await;
        emitter.finish(Terminal::Error("fatal".into())).await;

        let (n, buf) = drain.await.unwrap();
        assert_eq!(n, 2);
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"progress\":5"));
        assert!(lines[1].contains("\"error\":true"));
    }
}
