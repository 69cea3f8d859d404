// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Binary framing for the control and blast sockets.
//!
//! Every message is a fixed 16-byte header followed by a JSON payload:
//!
//! ```text
//! +--------+----------+--------+--------+----------------+
//! | opcode | sequence | status | length | payload bytes  |
//! +--------+----------+--------+--------+----------------+
//!   u32be     u32be      u32be    u32be    length bytes
//! ```
//!
//! Replies carry the request's sequence number. A malformed header or an
//! oversized length means the connection is beyond recovery and is
//! dropped.

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U32};

pub const FRAME_HEADER_LEN: usize = 16;
/// Payloads above this indicate a desynchronized or hostile peer.
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameHeader {
    pub opcode: U32<BigEndian>,
    pub sequence: U32<BigEndian>,
    pub status: U32<BigEndian>,
    pub length: U32<BigEndian>,
}

/// Control-channel operations. The blast channel reuses the same
/// framing with its single `GetObject` opcode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Start = 0x01,
    Stop = 0x02,
    SetScope = 0x03,
    SetSpec = 0x04,
    SetPushAttrs = 0x05,
    SetBlob = 0x06,
    SetBlobBySignature = 0x07,
    SetObj = 0x08,
    SendObj = 0x09,
    ReexecuteFilters = 0x0a,
    RequestStats = 0x0b,
    SessionVarsGet = 0x0c,
    SessionVarsSet = 0x0d,
    GetObject = 0x20,
}

/// Returned when a frame carries an opcode this side does not serve.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown opcode: 0x{0:02x}")]
pub struct UnknownOpcode(pub u32);

impl TryFrom<u32> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(v: u32) -> Result<Self, UnknownOpcode> {
        Ok(match v {
            0x01 => Self::Start,
            0x02 => Self::Stop,
            0x03 => Self::SetScope,
            0x04 => Self::SetSpec,
            0x05 => Self::SetPushAttrs,
            0x06 => Self::SetBlob,
            0x07 => Self::SetBlobBySignature,
            0x08 => Self::SetObj,
            0x09 => Self::SendObj,
            0x0a => Self::ReexecuteFilters,
            0x0b => Self::RequestStats,
            0x0c => Self::SessionVarsGet,
            0x0d => Self::SessionVarsSet,
            0x20 => Self::GetObject,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

/// Reply status codes, the control channel's error vocabulary.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    EncodingError = 1,
    ProcedureUnavailable = 2,
    CookieExpired = 3,
    KeyRejected = 4,
    CacheMiss = 5,
    ServerFailure = 6,
}

impl TryFrom<u32> for Status {
    type Error = UnknownOpcode;

    fn try_from(v: u32) -> Result<Self, UnknownOpcode> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::EncodingError,
            2 => Self::ProcedureUnavailable,
            3 => Self::CookieExpired,
            4 => Self::KeyRejected,
            5 => Self::CacheMiss,
            6 => Self::ServerFailure,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

/// One decoded frame. The opcode is left raw so a dispatcher can answer
/// `procedure-unavailable` instead of dropping the connection.
#[derive(Debug)]
pub struct Frame {
    pub opcode: u32,
    pub sequence: u32,
    pub status: u32,
    pub payload: Vec<u8>,
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut raw = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut raw)
        .await
        .context("connection closed mid-frame")?;
    let header = FrameHeader::read_from_bytes(&raw)
        .ok()
        .context("malformed frame header")?;

    let len = header.length.get() as usize;
    if len > MAX_PAYLOAD {
        bail!("frame payload of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        opcode: header.opcode.get(),
        sequence: header.sequence.get(),
        status: header.status.get(),
        payload,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: u32,
    sequence: u32,
    status: Status,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        bail!("refusing to send oversized frame of {} bytes", payload.len());
    }
    let header = FrameHeader {
        opcode: U32::new(opcode),
        sequence: U32::new(sequence),
        status: U32::new(status as u32),
        length: U32::new(payload.len() as u32),
    };
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
