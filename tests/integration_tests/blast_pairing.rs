// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use diamondd::proto::{Opcode, Status, read_frame, write_frame};
use serial_test::serial;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::Duration};

use super::common::{connect_control, reply_status, spawn_server};

#[tokio::test]
#[serial]
async fn test_data_socket_pairs_by_nonce() -> Result<()> {
    let server = spawn_server().await?;
    let (_control, nonce) = connect_control(&server).await?;

    let mut data = TcpStream::connect(("127.0.0.1", server.port_base + 1)).await?;
    data.write_all(&nonce.to_be_bytes()).await?;

    // A non-GetObject opcode on the data channel is refused but the
    // connection stays up, proving the pairing took.
    write_frame(&mut data, Opcode::Start as u32, 1, Status::Ok, &[]).await?;
    let reply = read_frame(&mut data).await?;
    assert_eq!(reply_status(&reply), Status::ProcedureUnavailable);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_unknown_nonce_is_dropped() -> Result<()> {
    let server = spawn_server().await?;
    let (_control, nonce) = connect_control(&server).await?;

    let mut data = TcpStream::connect(("127.0.0.1", server.port_base + 1)).await?;
    data.write_all(&nonce.wrapping_add(1).to_be_bytes()).await?;

    // The server hangs up without serving; the write may already fail,
    // and the read definitely does.
    let _ = write_frame(&mut data, Opcode::GetObject as u32, 1, Status::Ok, &[]).await;
    let read = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut data)).await;
    match read {
        Ok(Err(_)) => {},
        Ok(Ok(frame)) => panic!("unpaired data socket got a reply: {frame:?}"),
        Err(_) => panic!("server neither replied nor hung up"),
    }
    Ok(())
}
