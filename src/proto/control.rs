// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed payloads for the control channel, one request/response pair per
//! opcode. Bodies are JSON; raw byte fields travel base64-encoded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{filter::stats::FilterCounters, sig::Signature};

/// Serde adapter: `Vec<u8>` as a base64 string.
pub mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(de::Error::custom)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRequest {
    pub search_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetScopeRequest {
    /// The full cookie envelope, markers included.
    pub cookie: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetSpecRequest {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Content signature the client computed; the server re-derives and
    /// verifies it before caching the spec under it.
    pub sig: Signature,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPushAttrsRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetBlobRequest {
    pub filter_name: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetBlobBySignatureRequest {
    pub filter_name: String,
    pub sig: Signature,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetObjRequest {
    pub sig: Signature,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendObjRequest {
    pub sig: Signature,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReexecuteRequest {
    pub object_id: String,
    pub attr_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedAttr {
    pub name: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReexecuteResponse {
    pub attrs: Vec<NamedAttr>,
}

/// Search-level counters alongside the per-filter table.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    /// Expected object count from the scope manifests' `count adjust`
    /// entries; a progress estimate, not a promise.
    pub objs_scope_expected: i64,
    pub objs_total: u64,
    pub objs_processed: u64,
    pub objs_dropped: u64,
    pub objs_passed: u64,
    /// Objects fully resolved by stage-1 cache hits.
    pub objs_cache_passed: u64,
    pub objs_cache_dropped: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilterStatsEntry {
    pub name: String,
    #[serde(flatten)]
    pub counters: FilterCounters,
    pub avg_exec_ns: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub search: SearchStats,
    pub filters: Vec<FilterStatsEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionVarsResponse {
    pub vars: HashMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionVarsSetRequest {
    pub vars: HashMap<String, f64>,
}

/// Empty body used by requests/replies that carry no data.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}
