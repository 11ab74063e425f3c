//! Child-process bridge.
//!
//! When the worker runs in its own OS process, the controller's channels and
//! abort flag are mirrored over the process pipes:
//!
//! - **stdin**: one [`WorkerFrame`] JSON document per line. `command` frames
//!   are queued on the local command channel, `abort` sets the local abort
//!   flag, `shutdown` (or end of input) stops the worker.
//! - **stdout**: one [`ScanResult`] JSON document per line, in emission order.
//!
//! Logs must go to stderr; stdout carries nothing but results.

use common::{decode_line, encode_line, Channel, ScanResult, WorkerFrame};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::instrument::Instrument;
use crate::scanner::{Scanner, WorkerLink};

/// Run a [`Scanner`] behind the process's own stdin/stdout.
pub async fn serve_stdio<I>(instrument: I) -> std::io::Result<()>
where
    I: Instrument + 'static,
{
    serve(tokio::io::stdin(), tokio::io::stdout(), instrument).await
}

/// Run a [`Scanner`] fed from `input` and reporting to `output`.
///
/// Returns after the worker stopped and every result it produced has been
/// written.
pub async fn serve<R, W, I>(input: R, output: W, instrument: I) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    I: Instrument + 'static,
{
    let link = WorkerLink::new();
    let reader = tokio::spawn(read_frames(input, link.clone()));
    let writer = tokio::spawn(write_results(
        output,
        link.channels.results.clone(),
        link.stop.clone(),
    ));

    Scanner::new(link.clone(), instrument).run().await;
    link.stop.cancel();
    reader.abort();

    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn read_frames<R>(input: R, link: WorkerLink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Controller closed stdin");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<WorkerFrame>(&line) {
            Ok(WorkerFrame::Command(command)) => {
                debug!(verb = %command.verb, "Frame received");
                link.channels.commands.send(command);
            }
            Ok(WorkerFrame::Abort) => {
                info!("Abort requested by controller");
                link.abort.set();
            }
            Ok(WorkerFrame::Shutdown) => {
                info!("Shutdown requested by controller");
                break;
            }
            Err(e) => warn!(error = %e, line = %line, "Ignoring malformed frame"),
        }
    }
    link.stop.cancel();
}

async fn write_results<W>(
    mut output: W,
    results: Channel<ScanResult>,
    stop: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(result) = results.recv_until(&stop).await {
        write_result(&mut output, &result).await?;
    }
    // Flush whatever the worker produced before it stopped
    for result in results.drain() {
        write_result(&mut output, &result).await?;
    }
    output.flush().await
}

async fn write_result<W>(output: &mut W, result: &ScanResult) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(result).map_err(std::io::Error::other)?;
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}
