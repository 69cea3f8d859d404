// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Content signatures.
//!
//! Every piece of content the server tracks — object bodies, attribute
//! values, filter code, attribute sets — is addressed by a 128-bit MD5
//! digest. Signatures are rendered as 32 lowercase hex digits.

use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{Result, ensure};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

pub const SIG_LEN: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature(pub [u8; SIG_LEN]);

impl Signature {
    /// Digest of a single buffer.
    pub fn of_bytes(data: impl AsRef<[u8]>) -> Self {
        let mut ctx = Md5::new();
        ctx.update(data.as_ref());
        Self(ctx.finalize().into())
    }

    /// Digest over a sequence of buffers, equivalent to hashing their
    /// concatenation. Empty parts contribute nothing.
    pub fn of_parts<'a, I>(parts: I) -> Self
    where I: IntoIterator<Item = &'a [u8]> {
        let mut ctx = Md5::new();
        for part in parts {
            if !part.is_empty() {
                ctx.update(part);
            }
        }
        Self(ctx.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; SIG_LEN]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

impl FromStr for Signature {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim())?;
        ensure!(raw.len() == SIG_LEN, "signature must be {SIG_LEN} bytes");
        let mut out = [0u8; SIG_LEN];
        out.copy_from_slice(&raw);
        Ok(Self(out))
    }
}

// Signatures travel in JSON payloads as hex strings.
impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An unordered set of `(attribute name, value signature)` pairs.
///
/// The canonical serialization sorts on the attribute name so that the
/// set signature is reproducible no matter the insertion order; it is
/// used as the `iattr_sig` component of cache keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrSigSet {
    entries: BTreeMap<String, Signature>,
}

impl AttrSigSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one pair. Re-inserting a name overwrites its signature,
    /// keeping the set consistent with the latest attribute state seen.
    pub fn insert(&mut self, name: impl Into<String>, sig: Signature) {
        self.entries.insert(name.into(), sig);
    }

    pub fn contains(&self, name: &str, sig: &Signature) -> bool {
        self.entries.get(name) == Some(sig)
    }

    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// True when every pair of `other` appears in `self` unchanged.
    pub fn is_superset_of(&self, other: &AttrSigSet) -> bool {
        other.iter().all(|(n, s)| self.contains(n, s))
    }

    /// Merge all pairs of `other` into `self`.
    pub fn extend_from(&mut self, other: &AttrSigSet) {
        for (name, sig) in other.iter() {
            self.entries.insert(name.to_string(), *sig);
        }
    }

    /// Canonical byte serialization: name-sorted `name NUL sig` records.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * (SIG_LEN + 8));
        for (name, sig) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(sig.as_bytes());
        }
        out
    }

    /// The set's own signature: digest of the canonical serialization.
    pub fn signature(&self) -> Signature {
        Signature::of_bytes(self.canonical_bytes())
    }
}

impl FromIterator<(String, Signature)> for AttrSigSet {
    fn from_iter<I: IntoIterator<Item = (String, Signature)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
