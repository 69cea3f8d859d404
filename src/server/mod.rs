// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection setup and the two-socket pairing handshake.
//!
//! The control socket opens first; the server answers with a 32-bit
//! nonce. The client then opens the data socket and presents the same
//! nonce, pairing the two into one search session. A data connection
//! with an unknown nonce is dropped.

pub mod control;
pub mod data;
pub mod search;

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::RngExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cache::{CacheDb, CacheDirs},
    cfg::config::Config,
    server::search::{Search, SearchShared},
};

pub struct Server {
    cfg: Arc<Config>,
    dirs: CacheDirs,
    cache: Arc<StdMutex<CacheDb>>,
    pending: Arc<DashMap<u32, Arc<SearchShared>>>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(cfg: Config) -> Result<Self> {
        let dirs = CacheDirs::new(&cfg.cache.cache_dir);
        dirs.ensure()?;
        let cache = CacheDb::open(dirs.root()).context("cannot open result cache")?;
        Ok(Self {
            cfg: Arc::new(cfg),
            dirs,
            cache: Arc::new(StdMutex::new(cache)),
            pending: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept loop for both listeners; runs until cancelled.
    pub async fn run(self) -> Result<()> {
        let bind = &self.cfg.server.bind_address;
        let control = TcpListener::bind((bind.as_str(), self.cfg.control_port()))
            .await
            .with_context(|| format!("cannot bind control port {}", self.cfg.control_port()))?;
        let data = TcpListener::bind((bind.as_str(), self.cfg.data_port()))
            .await
            .with_context(|| format!("cannot bind data port {}", self.cfg.data_port()))?;
        info!(
            control = self.cfg.control_port(),
            data = self.cfg.data_port(),
            "listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = control.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "control connection");
                        self.spawn_control(stream);
                    },
                    Err(e) => warn!("control accept failed: {e}"),
                },
                accepted = data.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "data connection");
                        self.spawn_data(stream);
                    },
                    Err(e) => warn!("data accept failed: {e}"),
                },
            }
        }
    }

    fn spawn_control(&self, mut stream: TcpStream) {
        let cfg = Arc::clone(&self.cfg);
        let dirs = self.dirs.clone();
        let cache = Arc::clone(&self.cache);
        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let nonce: u32 = rand::rng().random();
            if let Err(e) = stream.write_all(&nonce.to_be_bytes()).await {
                warn!("nonce write failed: {e}");
                return;
            }

            let search = Search::new(cfg, dirs, cache);
            pending.insert(nonce, search.shared());

            control::serve_control(stream, search, cancel).await;
            pending.remove(&nonce);
        });
    }

    fn spawn_data(&self, mut stream: TcpStream) {
        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut raw = [0u8; 4];
            if let Err(e) = stream.read_exact(&mut raw).await {
                warn!("nonce read failed: {e}");
                return;
            }
            let nonce = u32::from_be_bytes(raw);

            let Some(shared) = pending.get(&nonce).map(|s| Arc::clone(s.value())) else {
                warn!("data connection presented unknown nonce");
                return;
            };
            data::serve_data(stream, shared, cancel).await;
        });
    }
}
