use std::io::{self, Write};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, trace};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Outcome},
    progress::{Progress, ProgressReporter},
};

fn join_error(e: task::JoinError) -> Error {
    Error::Storage(io::Error::new(io::ErrorKind::Other, e))
}

/// Write a chunk on the blocking pool, handing the writer back afterwards.
async fn write_chunk<W>(mut output: W, chunk: Bytes) -> Result<(W, io::Result<()>), Error>
where
    W: Write + Send + 'static,
{
    task::spawn_blocking(move || {
        let result = output.write_all(&chunk);
        (output, result)
    })
    .await
    .map_err(join_error)
}

/// The writer is `None` only if a blocking write panicked.
async fn copy_stream<S, W, F>(
    stream: &mut S,
    expected_size: u64,
    output: &mut Option<W>,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
) -> Result<Outcome<()>, Error>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Write + Send + 'static,
    F: FnMut(Progress),
{
    let mut received = 0u64;

    progress.report(0);

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            item = stream.next() => item,
        };

        let chunk = match item {
            Some(c) => c.map_err(|e| Error::Network(e.into()))?,
            None => break,
        };

        let total = received + chunk.len() as u64;
        if total > expected_size {
            return Err(Error::SizeMismatch {
                expected: expected_size,
                received: total,
            });
        }

        if let Some(w) = output.take() {
            let (w, result) = write_chunk(w, chunk).await?;
            *output = Some(w);
            result.map_err(Error::Storage)?;
        }

        received = total;
        trace!("Received {received}/{expected_size} bytes");
        progress.report(received);
    }

    if received < expected_size {
        return Err(Error::Network(format!(
            "Connection closed after {received} of {expected_size} bytes").into()));
    }

    Ok(Outcome::Completed(()))
}

/// Copy the binary payload from `stream` to `output`, checking for
/// cancellation before each chunk. Writes run on the blocking thread pool.
/// The output is flushed and closed on every exit path.
pub async fn download<S, W, F>(
    mut stream: S,
    expected_size: u64,
    output: W,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<F>,
) -> Result<Outcome<()>, Error>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Write + Send + 'static,
    F: FnMut(Progress),
{
    debug!("Downloading {expected_size} bytes");

    let mut output = Some(output);
    let result = copy_stream(&mut stream, expected_size, &mut output, cancel, progress).await;

    let Some(mut output) = output else {
        return result;
    };

    let flushed = task::spawn_blocking(move || output.flush())
        .await
        .map_err(join_error)
        .and_then(|r| r.map_err(Error::Storage));

    match (result, flushed) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) | (Err(e), _) => Err(e),
    }
}
