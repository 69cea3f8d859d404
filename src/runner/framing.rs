// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Framing for the filter subprocess pipes.
//!
//! Every primitive travels as a decimal byte-length line, the payload
//! bytes, and a trailing newline:
//!
//! ```text
//! 5\nhello\n        a five-byte string or binary
//! \n                an absent value (empty length line)
//! result\n          a bare tag line
//! ```
//!
//! Integers and doubles are rendered as decimal strings inside the same
//! framing; string lists are terminated by an absent value. A reader that
//! observes malformed framing fails the connection — there is no way to
//! resynchronize a desynchronized pipe.
//!
//! The engine talks to children asynchronously; the child side is
//! deliberately blocking because filter callbacks re-enter the protocol
//! synchronously from inside the loaded module's eval.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest frame either side will accept. Bodies above this indicate a
/// desynchronized pipe, not a legitimate value.
pub const MAX_FRAME: usize = 512 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Engine side (async)

pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line).await?;
        if n == 0 {
            bail!("filter pipe closed");
        }
        if !line.ends_with('\n') {
            bail!("filter pipe framing desynchronized: unterminated line");
        }
        line.pop();
        Ok(line)
    }

    /// A bare tag line.
    pub async fn read_tag(&mut self) -> Result<String> {
        self.read_line().await
    }

    /// A length-prefixed value; `None` is the absent value.
    pub async fn read_binary(&mut self) -> Result<Option<Vec<u8>>> {
        let line = self.read_line().await?;
        if line.is_empty() {
            return Ok(None);
        }
        let len: usize = line
            .parse()
            .with_context(|| format!("bad frame length {line:?}"))?;
        if len > MAX_FRAME {
            bail!("frame of {len} bytes exceeds limit");
        }
        let mut buf = vec![0u8; len + 1];
        tokio::io::AsyncReadExt::read_exact(&mut self.inner, &mut buf).await?;
        if buf.pop() != Some(b'\n') {
            bail!("filter pipe framing desynchronized: missing frame terminator");
        }
        Ok(Some(buf))
    }

    pub async fn read_string(&mut self) -> Result<Option<String>> {
        match self.read_binary().await? {
            Some(raw) => Ok(Some(String::from_utf8(raw)?)),
            None => Ok(None),
        }
    }

    /// Strings until the absent-value terminator.
    pub async fn read_string_list(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(s) = self.read_string().await? {
            out.push(s);
        }
        Ok(out)
    }

    pub async fn read_int(&mut self) -> Result<i64> {
        let s = self
            .read_string()
            .await?
            .context("expected integer, got absent value")?;
        Ok(s.trim().parse()?)
    }

    pub async fn read_double(&mut self) -> Result<f64> {
        let s = self
            .read_string()
            .await?
            .context("expected double, got absent value")?;
        Ok(s.trim().parse()?)
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_tag(&mut self, tag: &str) -> Result<()> {
        self.inner.write_all(tag.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(format!("{}\n", data.len()).as_bytes())
            .await?;
        self.inner.write_all(data).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// The absent value: an empty length line.
    pub async fn write_none(&mut self) -> Result<()> {
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_binary(s.as_bytes()).await
    }

    pub async fn write_string_list(&mut self, items: &[String]) -> Result<()> {
        for item in items {
            self.write_string(item).await?;
        }
        self.write_none().await
    }

    pub async fn write_int(&mut self, v: i64) -> Result<()> {
        self.write_string(&v.to_string()).await
    }

    pub async fn write_double(&mut self, v: f64) -> Result<()> {
        // {:?} prints the shortest decimal that round-trips.
        self.write_string(&format!("{v:?}")).await
    }

    pub async fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_string(if v { "true" } else { "false" }).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Child side (blocking)

pub struct BlockingFrameReader<R> {
    inner: R,
}

impl<R: BufRead> BlockingFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line)?;
        if n == 0 {
            bail!("engine pipe closed");
        }
        if !line.ends_with('\n') {
            bail!("engine pipe framing desynchronized: unterminated line");
        }
        line.pop();
        Ok(line)
    }

    pub fn read_tag(&mut self) -> Result<String> {
        self.read_line()
    }

    pub fn read_binary(&mut self) -> Result<Option<Vec<u8>>> {
        let line = self.read_line()?;
        if line.is_empty() {
            return Ok(None);
        }
        let len: usize = line
            .parse()
            .with_context(|| format!("bad frame length {line:?}"))?;
        if len > MAX_FRAME {
            bail!("frame of {len} bytes exceeds limit");
        }
        let mut buf = vec![0u8; len + 1];
        std::io::Read::read_exact(&mut self.inner, &mut buf)?;
        if buf.pop() != Some(b'\n') {
            bail!("engine pipe framing desynchronized: missing frame terminator");
        }
        Ok(Some(buf))
    }

    pub fn read_string(&mut self) -> Result<Option<String>> {
        match self.read_binary()? {
            Some(raw) => Ok(Some(String::from_utf8(raw)?)),
            None => Ok(None),
        }
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(s) = self.read_string()? {
            out.push(s);
        }
        Ok(out)
    }

    pub fn read_double(&mut self) -> Result<f64> {
        let s = self
            .read_string()?
            .context("expected double, got absent value")?;
        Ok(s.trim().parse()?)
    }
}

pub struct BlockingFrameWriter<W> {
    inner: W,
}

impl<W: Write> BlockingFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_tag(&mut self, tag: &str) -> Result<()> {
        writeln!(self.inner, "{tag}")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        writeln!(self.inner, "{}", data.len())?;
        self.inner.write_all(data)?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn write_none(&mut self) -> Result<()> {
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_binary(s.as_bytes())
    }

    pub fn write_int(&mut self, v: i64) -> Result<()> {
        self.write_string(&v.to_string())
    }

    pub fn write_double(&mut self, v: f64) -> Result<()> {
        self.write_string(&format!("{v:?}"))
    }
}
