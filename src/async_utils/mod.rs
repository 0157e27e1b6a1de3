//! Asynchronous utilities for use with Tokio.
//!
//! This holds the small amount of plumbing we need around external
//! processes: reading their output without deadlocking on full pipes,
//! checking their exit status, and telling a running job that its caller has
//! gone away.

use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    sync::oneshot,
};

use crate::prelude::*;

pub mod io;

/// Report any command failures, and include any error output.
///
/// Standard output is logged at `debug`. Standard error is logged at `warn`
/// only if the command failed, since most of our tools are chatty on stderr
/// even when things go well.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from failed command",
        );
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} was terminated by a signal, with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Read `reader` to the end, keeping only the last `limit` bytes.
///
/// Used for child process pipes. We have to drain them while the child runs,
/// or a chatty child blocks forever on a full pipe.
pub async fn read_tail<R>(reader: Option<R>, limit: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut kept = Vec::with_capacity(limit.min(64 * 1024));
    let mut chunk = vec![0; 8 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&chunk[..n]);
        // Trim lazily so we don't shuffle bytes on every read.
        if kept.len() > limit.saturating_mul(2) {
            kept.drain(..kept.len() - limit);
        }
    }
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}

/// Create a linked [`CancelHandle`] and [`CancelSignal`].
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = oneshot::channel();
    (
        CancelHandle { tx: Some(tx) },
        CancelSignal {
            rx,
            fired: false,
        },
    )
}

/// The sending half of a cancellation signal.
///
/// Dropping this handle cancels, exactly like calling [`CancelHandle::cancel`].
/// This is what makes an aborted HTTP request stop its job: the request
/// future owns the handle, and hyper drops that future when the client
/// disconnects.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    /// Cancel now.
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            // The receiver may already be gone, which is fine.
            let _ = tx.send(());
        }
    }
}

/// The receiving half of a cancellation signal.
#[derive(Debug)]
pub struct CancelSignal {
    rx: oneshot::Receiver<()>,
    fired: bool,
}

impl CancelSignal {
    /// Wait until cancelled. Safe to use repeatedly in `tokio::select!`.
    pub async fn cancelled(&mut self) {
        if self.fired {
            return;
        }
        // Either an explicit cancel or a dropped handle.
        let _ = (&mut self.rx).await;
        self.fired = true;
    }
}
