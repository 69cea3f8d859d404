// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use diamondd::{
    cfg::{cli::config_path_from_args, config::Config, logger::init_logger},
    runner::process::RUNNER_PATH_ENV,
    server::Server,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let cfg = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config {config_path:?}"))?;

    let logger_path = config_path.display().to_string();
    let _logger_guard = init_logger(&logger_path)?;

    // Let the runner-path config knob reach the executor's spawns.
    if let Some(runner_path) = &cfg.runner.runner_path {
        // SAFETY: single-threaded at this point; no other thread reads
        // the environment concurrently.
        unsafe { std::env::set_var(RUNNER_PATH_ENV, runner_path) };
    }

    let server = Server::new(cfg)?;
    let cancel = server.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    server.run().await
}
