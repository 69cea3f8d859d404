// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Filter spec files.
//!
//! A spec file is plain text, one record per filter, records separated by
//! blank lines. Each record is a keyword-argument list:
//!
//! ```text
//! FILTER f_has_red
//! THRESHOLD 1
//! EVAL_FUNCTION f_eval_red
//! INIT_FUNCTION f_init_red
//! FINI_FUNCTION f_fini_red
//! ARG 0.5
//! REQUIRES f_rgb
//! MERIT 10
//! ```
//!
//! `ARG` and `REQUIRES` repeat; `MERIT` biases the initial ordering.
//! Lines starting with `#` are comments.

use std::fmt::Write as _;

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;

use crate::sig::Signature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub name: String,
    pub threshold: i32,
    pub eval_function: String,
    pub init_function: String,
    pub fini_function: String,
    pub args: Vec<String>,
    pub requires: Vec<String>,
    pub merit: i32,
    /// Opaque init blob, installed separately over the control channel.
    pub blob: Bytes,
}

impl FilterSpec {
    /// The filter's canonical signature: a digest over the module
    /// signatures, the eval entry point, the static arguments and the
    /// blob. Identical code + identical inputs hash identically, which
    /// is what makes cache entries portable across searches.
    pub fn signature(&self, code_sigs: &[Signature]) -> Signature {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(code_sigs.len() + self.args.len() + 2);
        for sig in code_sigs {
            parts.push(sig.as_bytes());
        }
        parts.push(self.eval_function.as_bytes());
        for arg in &self.args {
            parts.push(arg.as_bytes());
        }
        parts.push(&self.blob);
        Signature::of_parts(parts)
    }
}

/// Parse a whole spec file into filter records.
pub fn parse_spec_file(text: &str) -> Result<Vec<FilterSpec>> {
    let mut filters = Vec::new();
    let mut current: Option<FilterSpec> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.starts_with('#') {
            continue;
        }
        if line.is_empty() {
            if let Some(done) = current.take() {
                filters.push(done);
            }
            continue;
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };

        if keyword == "FILTER" {
            if let Some(done) = current.take() {
                filters.push(done);
            }
            ensure!(!rest.is_empty(), "line {}: FILTER needs a name", lineno + 1);
            current = Some(FilterSpec {
                name: rest.to_string(),
                threshold: 0,
                eval_function: String::new(),
                init_function: String::new(),
                fini_function: String::new(),
                args: Vec::new(),
                requires: Vec::new(),
                merit: 0,
                blob: Bytes::new(),
            });
            continue;
        }

        let filt = current
            .as_mut()
            .with_context(|| format!("line {}: {keyword} before FILTER", lineno + 1))?;

        match keyword {
            "THRESHOLD" => {
                filt.threshold = rest
                    .parse()
                    .with_context(|| format!("line {}: bad THRESHOLD", lineno + 1))?
            },
            "EVAL_FUNCTION" => filt.eval_function = rest.to_string(),
            "INIT_FUNCTION" => filt.init_function = rest.to_string(),
            "FINI_FUNCTION" => filt.fini_function = rest.to_string(),
            "ARG" => filt.args.push(rest.to_string()),
            "REQUIRES" => filt.requires.push(rest.to_string()),
            "MERIT" => {
                filt.merit = rest
                    .parse()
                    .with_context(|| format!("line {}: bad MERIT", lineno + 1))?
            },
            other => bail!("line {}: unknown keyword {other}", lineno + 1),
        }
    }
    if let Some(done) = current.take() {
        filters.push(done);
    }

    for filt in &filters {
        ensure!(
            !filt.eval_function.is_empty(),
            "filter {} missing EVAL_FUNCTION",
            filt.name
        );
        ensure!(
            !filt.init_function.is_empty(),
            "filter {} missing INIT_FUNCTION",
            filt.name
        );
        ensure!(
            !filt.fini_function.is_empty(),
            "filter {} missing FINI_FUNCTION",
            filt.name
        );
    }

    Ok(filters)
}

/// Serialize records back into the file format. `parse(serialize(x)) == x`
/// and serialize-parse-serialize is a fixed point.
pub fn serialize_spec_file(filters: &[FilterSpec]) -> String {
    let mut out = String::new();
    for (i, filt) in filters.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        // Writing to a String cannot fail.
        let _ = writeln!(out, "FILTER {}", filt.name);
        let _ = writeln!(out, "THRESHOLD {}", filt.threshold);
        let _ = writeln!(out, "EVAL_FUNCTION {}", filt.eval_function);
        let _ = writeln!(out, "INIT_FUNCTION {}", filt.init_function);
        let _ = writeln!(out, "FINI_FUNCTION {}", filt.fini_function);
        for arg in &filt.args {
            let _ = writeln!(out, "ARG {arg}");
        }
        for dep in &filt.requires {
            let _ = writeln!(out, "REQUIRES {dep}");
        }
        if filt.merit != 0 {
            let _ = writeln!(out, "MERIT {}", filt.merit);
        }
    }
    out
}
