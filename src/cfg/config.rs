// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::filter::opt::PolicyKind;

/// Environment override for the control-channel port; the data channel
/// always listens on the next port up.
pub const PORT_BASE_ENV: &str = "DIAMOND_PORT_BASE";
pub const DEFAULT_PORT_BASE: u16 = 5872;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Identity and listening sockets.
    pub server: ServerConfig,
    /// Result cache and content-addressed stores.
    pub cache: CacheConfig,
    /// Scope/object HTTP fetcher limits.
    #[serde(default)]
    pub fetcher: FetcherConfig,
    /// Filter-ordering optimizer knobs.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Filter subprocess runner knobs.
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "ServerName")]
    /// FQDN this server answers to; scope cookies must name it.
    pub server_name: String,

    #[serde(default = "default_port_base", rename = "PortBase")]
    /// Control channel port; data channel is PortBase+1.
    pub port_base: u16,

    #[serde(default = "default_bind", rename = "BindAddress")]
    pub bind_address: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CacheConfig {
    #[serde(rename = "CacheDir")]
    pub cache_dir: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_scope_fetches", rename = "MaxScopeFetches")]
    /// In-flight scope-manifest fetches.
    pub max_scope_fetches: usize,

    #[serde(default = "default_object_fetches", rename = "MaxObjectFetches")]
    /// Concurrent object-body fetches.
    pub max_object_fetches: usize,

    #[serde(default = "default_queue_depth", rename = "QueueDepth")]
    /// Backpressure bound on the scope URI channel.
    pub queue_depth: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OptimizerConfig {
    #[serde(default, rename = "Policy")]
    pub policy: PolicyKind,

    #[serde(default = "default_bypass", rename = "BypassThreshold")]
    /// Random-draw cutoff for filter bypass: a uniform draw above this
    /// value skips the filter, collecting unbiased selectivity samples.
    /// 1.0 disables bypassing.
    pub bypass_threshold: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RunnerConfig {
    #[serde(default, rename = "RunnerPath")]
    /// Override for the filter-runner executable path.
    pub runner_path: Option<String>,

    #[serde(
        default = "default_runner_timeout",
        rename = "HandshakeTimeout",
        with = "serde_secs"
    )]
    /// How long a runner may take to resolve symbols and init.
    pub handshake_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_scope_fetches: default_scope_fetches(),
            max_object_fetches: default_object_fetches(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            bypass_threshold: default_bypass(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_path: None,
            handshake_timeout: default_runner_timeout(),
        }
    }
}

fn default_port_base() -> u16 {
    DEFAULT_PORT_BASE
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_scope_fetches() -> usize {
    2
}
fn default_object_fetches() -> usize {
    64
}
fn default_queue_depth() -> usize {
    64
}
fn default_bypass() -> f64 {
    1.0
}
fn default_runner_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and applies environment overrides.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var(PORT_BASE_ENV) {
            self.server.port_base = port
                .parse()
                .with_context(|| format!("bad {PORT_BASE_ENV} value {port:?}"))?;
        }

        ensure!(
            !self.server.server_name.is_empty(),
            "ServerName must not be empty"
        );
        ensure!(
            !self.cache.cache_dir.is_empty(),
            "CacheDir must not be empty"
        );
        ensure!(self.server.port_base > 0, "PortBase must be > 0");
        ensure!(
            self.server.port_base < u16::MAX,
            "PortBase must leave room for the data port"
        );
        ensure!(
            self.fetcher.max_scope_fetches >= 1,
            "MaxScopeFetches must be >= 1"
        );
        ensure!(
            self.fetcher.max_object_fetches >= 1,
            "MaxObjectFetches must be >= 1"
        );
        ensure!(self.fetcher.queue_depth >= 1, "QueueDepth must be >= 1");
        ensure!(
            (0.0..=1.0).contains(&self.optimizer.bypass_threshold),
            "BypassThreshold must be within [0, 1]"
        );
        Ok(())
    }

    pub fn control_port(&self) -> u16 {
        self.server.port_base
    }

    pub fn data_port(&self) -> u16 {
        self.server.port_base + 1
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
