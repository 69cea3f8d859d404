// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::TcpListener as StdTcpListener;

use anyhow::{Context, Result};
use diamondd::{
    cfg::config::{CacheConfig, Config, FetcherConfig, OptimizerConfig, RunnerConfig, ServerConfig},
    proto::{Frame, Status, read_frame, write_frame},
    server::Server,
};
use serde::{Serialize, de::DeserializeOwned};
use tempfile::TempDir;
use tokio::{io::AsyncReadExt, net::TcpStream, time::Duration};

pub const TEST_SERVER_NAME: &str = "alpha.diamond.example";

/// Reserve a free control/data port pair on loopback.
fn free_port_base() -> Result<u16> {
    for _ in 0..16 {
        let probe = StdTcpListener::bind(("127.0.0.1", 0))?;
        let base = probe.local_addr()?.port();
        drop(probe);
        if base < u16::MAX - 1 && StdTcpListener::bind(("127.0.0.1", base + 1)).is_ok() {
            return Ok(base);
        }
    }
    anyhow::bail!("no free port pair found");
}

pub struct TestServer {
    pub port_base: u16,
    // Held for the server's lifetime; dropping it removes the cache dir.
    _cache_dir: TempDir,
}

/// Boot a server on loopback with a throwaway cache dir and wait until
/// the control port accepts.
pub async fn spawn_server() -> Result<TestServer> {
    let cache_dir = TempDir::new()?;
    let port_base = free_port_base()?;

    let cfg = Config {
        server: ServerConfig {
            server_name: TEST_SERVER_NAME.to_string(),
            port_base,
            bind_address: "127.0.0.1".to_string(),
        },
        cache: CacheConfig {
            cache_dir: cache_dir.path().display().to_string(),
        },
        fetcher: FetcherConfig::default(),
        optimizer: OptimizerConfig::default(),
        runner: RunnerConfig::default(),
    };

    let server = Server::new(cfg)?;
    tokio::spawn(server.run());

    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port_base)).await.is_ok() {
            return Ok(TestServer {
                port_base,
                _cache_dir: cache_dir,
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("server never came up on port {port_base}");
}

/// Open the control socket and consume the pairing nonce.
pub async fn connect_control(server: &TestServer) -> Result<(TcpStream, u32)> {
    let mut stream = TcpStream::connect(("127.0.0.1", server.port_base))
        .await
        .context("control connect")?;
    let mut raw = [0u8; 4];
    stream.read_exact(&mut raw).await.context("nonce read")?;
    Ok((stream, u32::from_be_bytes(raw)))
}

/// One request/reply exchange on the control socket.
pub async fn call<B: Serialize>(
    stream: &mut TcpStream,
    opcode: u32,
    sequence: u32,
    body: &B,
) -> Result<Frame> {
    let payload = serde_json::to_vec(body)?;
    write_frame(stream, opcode, sequence, Status::Ok, &payload).await?;
    let reply = read_frame(stream).await?;
    anyhow::ensure!(reply.sequence == sequence, "reply for wrong sequence");
    Ok(reply)
}

pub fn decode_reply<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    Ok(serde_json::from_slice(&frame.payload)?)
}

pub fn reply_status(frame: &Frame) -> Status {
    Status::try_from(frame.status).unwrap_or(Status::ServerFailure)
}
