// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Content-addressed file stores under the cache directory.
//!
//! ```text
//! <cache-dir>/ocache.db            result cache
//! <cache-dir>/binary/<sig>.so      filter module binaries
//! <cache-dir>/specs/<sig>.spec     filter spec files
//! <cache-dir>/blobs/<sig>          opaque init blobs
//! <cache-dir>/filters/<sig>.cfg    per-filter configuration snapshots
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{filter::spec::FilterSpec, sig::Signature};

#[derive(Debug, Clone)]
pub struct CacheDirs {
    root: PathBuf,
}

impl CacheDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory layout if missing.
    pub fn ensure(&self) -> Result<()> {
        for sub in ["binary", "specs", "blobs", "filters"] {
            let dir = self.root.join(sub);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create cache dir {dir:?}"))?;
        }
        Ok(())
    }

    pub fn binary_path(&self, sig: &Signature) -> PathBuf {
        self.root.join("binary").join(format!("{sig}.so"))
    }

    pub fn spec_path(&self, sig: &Signature) -> PathBuf {
        self.root.join("specs").join(format!("{sig}.spec"))
    }

    pub fn blob_path(&self, sig: &Signature) -> PathBuf {
        self.root.join("blobs").join(sig.to_string())
    }

    pub fn filter_config_path(&self, filter_sig: &Signature) -> PathBuf {
        self.root.join("filters").join(format!("{filter_sig}.cfg"))
    }

    /// Store bytes content-addressed; returns the signature they landed
    /// under. Rewriting identical content is a no-op by construction.
    pub fn store_binary(&self, data: &[u8]) -> Result<Signature> {
        let sig = Signature::of_bytes(data);
        std::fs::write(self.binary_path(&sig), data)?;
        Ok(sig)
    }

    pub fn store_spec(&self, data: &[u8]) -> Result<Signature> {
        let sig = Signature::of_bytes(data);
        std::fs::write(self.spec_path(&sig), data)?;
        Ok(sig)
    }

    pub fn store_blob(&self, data: &[u8]) -> Result<Signature> {
        let sig = Signature::of_bytes(data);
        std::fs::write(self.blob_path(&sig), data)?;
        Ok(sig)
    }

    pub fn has_binary(&self, sig: &Signature) -> bool {
        self.binary_path(sig).is_file()
    }

    pub fn has_spec(&self, sig: &Signature) -> bool {
        self.spec_path(sig).is_file()
    }

    pub fn has_blob(&self, sig: &Signature) -> bool {
        self.blob_path(sig).is_file()
    }

    pub fn read_blob(&self, sig: &Signature) -> Result<Vec<u8>> {
        std::fs::read(self.blob_path(sig))
            .with_context(|| format!("blob {sig} not present in cache"))
    }

    pub fn read_spec(&self, sig: &Signature) -> Result<Vec<u8>> {
        std::fs::read(self.spec_path(sig))
            .with_context(|| format!("spec {sig} not present in cache"))
    }

    /// Snapshot one filter's configuration next to the cache, keyed by
    /// its canonical signature.
    pub fn write_filter_config(
        &self,
        filter_sig: &Signature,
        filt: &FilterSpec,
        spec_sig: &Signature,
        code_sigs: &[Signature],
    ) -> Result<()> {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "FNAME {}", filt.name);
        let _ = writeln!(out, "SPEC_SIG {spec_sig}");
        let _ = writeln!(out, "NUM_OBJECT_FILES {}", code_sigs.len());
        for sig in code_sigs {
            let _ = writeln!(out, "OBJECT_FILE {sig}");
        }
        if !filt.blob.is_empty() {
            let _ = writeln!(out, "BLOBLEN {}", filt.blob.len());
            let _ = writeln!(out, "BLOBSIG {}", Signature::of_bytes(&filt.blob));
        }
        std::fs::write(self.filter_config_path(filter_sig), out)?;
        Ok(())
    }
}
