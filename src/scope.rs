// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scope cookies.
//!
//! A cookie is an ASCII envelope asserting "this client may search these
//! servers until T" over a list of data-source URLs. Cryptographic
//! validation of the signature belongs to the external scope authority;
//! this module parses the envelope and enforces the two gates the server
//! owns: expiry and server-list membership.

use anyhow::{Context, Result, ensure};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use thiserror::Error;

const BEGIN_COOKIE: &str = "-----BEGIN OPENDIAMOND SCOPECOOKIE-----";
const END_COOKIE: &str = "-----END OPENDIAMOND SCOPECOOKIE-----";

/// Rejection reasons a client can act on; these map one-to-one onto
/// control-channel status codes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("scope cookie expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("scope cookie not valid for this server")]
    KeyRejected,
}

#[derive(Debug, Clone)]
pub struct ScopeCookie {
    pub signature: String,
    pub version: u32,
    pub serial: String,
    pub key_id: String,
    pub expires: DateTime<Utc>,
    pub servers: Vec<String>,
    /// Newline-separated data-source URLs.
    pub scope_urls: Vec<String>,
}

impl ScopeCookie {
    /// Parse one cookie envelope. Structural problems are plain errors
    /// (the connection replies with a generic failure); the gate checks
    /// live in [`ScopeCookie::validate_for`].
    pub fn parse(raw: &str) -> Result<Self> {
        let body = raw
            .split(BEGIN_COOKIE)
            .nth(1)
            .and_then(|rest| rest.split(END_COOKIE).next())
            .context("missing scope cookie markers")?;

        let encoded: String =
            body.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = BASE64
            .decode(encoded)
            .context("scope cookie payload is not valid base64")?;
        let text = String::from_utf8(decoded)
            .context("scope cookie payload is not UTF-8")?;

        // First line is the hex signature, then header lines until the
        // blank separator, then the scope body.
        let (signature, rest) = text
            .split_once('\n')
            .context("scope cookie payload is empty")?;
        let (headers, scope_body) = rest
            .split_once("\n\n")
            .context("scope cookie has no body separator")?;

        let mut version = None;
        let mut serial = None;
        let mut key_id = None;
        let mut expires = None;
        let mut servers = Vec::new();

        for line in headers.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "Version" => version = Some(value.parse::<u32>()?),
                "Serial" => serial = Some(value.to_string()),
                "KeyId" => key_id = Some(value.to_string()),
                "Expires" => {
                    expires = Some(
                        DateTime::parse_from_rfc3339(value)
                            .with_context(|| {
                                format!("bad Expires timestamp {value:?}")
                            })?
                            .with_timezone(&Utc),
                    )
                },
                "Servers" => {
                    servers = value
                        .split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                },
                _ => {},
            }
        }

        let version = version.context("scope cookie missing Version")?;
        ensure!(version == 1, "unsupported scope cookie version {version}");

        let scope_urls = scope_body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            signature: signature.trim().to_string(),
            version,
            serial: serial.context("scope cookie missing Serial")?,
            key_id: key_id.context("scope cookie missing KeyId")?,
            expires: expires.context("scope cookie missing Expires")?,
            servers,
            scope_urls,
        })
    }

    /// Gate checks: the cookie must not be expired and must name this
    /// server. No object is ever fetched against a cookie that fails
    /// either gate.
    pub fn validate_for(
        &self,
        server_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CookieError> {
        if self.expires < now {
            return Err(CookieError::Expired(self.expires));
        }
        if !self.servers.iter().any(|s| s == server_name) {
            return Err(CookieError::KeyRejected);
        }
        Ok(())
    }
}
