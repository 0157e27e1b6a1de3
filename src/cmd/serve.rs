//! The `serve` subcommand.

use crate::{config::ServerOpts, prelude::*, server};

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServerOpts) -> Result<()> {
    let scratch_root = opts.pipeline.scratch_root();
    let orchestrator = opts.pipeline.build_orchestrator(&scratch_root, true)?;
    server::serve(opts, orchestrator).await
}
