// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment fallback for the config file path.
pub const CONFIG_ENV: &str = "DIAMOND_CONFIG";

/// The daemon takes no subcommands: the only CLI surface is the config
/// file path, from argv or the environment.
pub fn config_path_from_args() -> Result<PathBuf> {
    let arg = std::env::args().nth(1);
    let raw = match arg {
        Some(path) => path,
        None => std::env::var(CONFIG_ENV)
            .context("no config path given (argv or DIAMOND_CONFIG)")?,
    };
    resolve_config_path(&raw)
}

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
