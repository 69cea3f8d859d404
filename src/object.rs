// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The object store: an immutable identity plus a mutable attribute map.
//!
//! An object's identity is the content signature of its source URI. The
//! body lives in the distinguished empty-name attribute. Every attribute
//! write recomputes the value signature together with the bytes, so the
//! signature can never go stale against its value.

use std::{collections::BTreeMap, time::Duration};

use bitflags::bitflags;
use bytes::Bytes;

use crate::sig::{AttrSigSet, Signature};

/// Name of the attribute carrying the object identity signature.
pub const OBJ_ID_ATTR: &str = "_ObjectID";
/// The empty name addresses the object body.
pub const OBJ_DATA_ATTR: &str = "";
/// Whole-stack execution time stamp, decimal nanoseconds.
pub const FLTRTIME_ATTR: &str = "_FIL_TIME.time";

/// Per-filter execution time stamp, decimal nanoseconds.
pub fn filter_time_attr(filter_name: &str) -> String {
    format!("_FIL_TIME_{filter_name}.time")
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u32 {
        /// Excluded from client shipping; still visible to the engine.
        const OMIT = 0x01;
    }
}

#[derive(Debug, Clone)]
pub struct AttrValue {
    pub data: Bytes,
    pub sig: Signature,
    pub flags: AttrFlags,
}

/// One candidate object flowing through the pipeline.
///
/// Owned by whichever stage currently processes it; the attribute map is
/// never shared across threads mid-flight.
#[derive(Debug, Clone)]
pub struct Object {
    id_sig: Signature,
    attrs: BTreeMap<String, AttrValue>,
}

impl Object {
    pub fn new(id_sig: Signature) -> Self {
        Self {
            id_sig,
            attrs: BTreeMap::new(),
        }
    }

    /// Identity derived from the source URI, the common case for objects
    /// produced by the scope fetcher.
    pub fn from_uri(uri: &str) -> Self {
        let mut obj = Self::new(Signature::of_bytes(uri.as_bytes()));
        obj.write_attr(OBJ_ID_ATTR, Bytes::copy_from_slice(uri.as_bytes()));
        obj
    }

    pub fn id_sig(&self) -> Signature {
        self.id_sig
    }

    pub fn read_attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Store `data` under `name`; the value signature is recomputed in the
    /// same step. Returns the new signature.
    pub fn write_attr(&mut self, name: &str, data: Bytes) -> Signature {
        let sig = Signature::of_bytes(&data);
        self.attrs.insert(name.to_string(), AttrValue {
            data,
            sig,
            flags: AttrFlags::empty(),
        });
        sig
    }

    /// Mark an attribute as omitted from client shipping. Returns whether
    /// the attribute existed.
    pub fn omit_attr(&mut self, name: &str) -> bool {
        match self.attrs.get_mut(name) {
            Some(attr) => {
                attr.flags |= AttrFlags::OMIT;
                true
            },
            None => false,
        }
    }

    /// Name-sorted iteration, so canonical serializations are stable.
    pub fn iter_attrs(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.attrs.get(OBJ_DATA_ATTR).map(|a| &a.data)
    }

    pub fn set_body(&mut self, data: Bytes) -> Signature {
        self.write_attr(OBJ_DATA_ATTR, data)
    }

    pub fn has_body(&self) -> bool {
        self.attrs.contains_key(OBJ_DATA_ATTR)
    }

    /// Snapshot of every attribute's `(name, sig)` pair, omitted ones
    /// included; omission only affects what ships to the client.
    pub fn attr_sig_set(&self) -> AttrSigSet {
        self.attrs
            .iter()
            .map(|(n, v)| (n.clone(), v.sig))
            .collect()
    }

    pub fn stamp_filter_time(&mut self, filter_name: &str, elapsed: Duration) {
        let name = filter_time_attr(filter_name);
        self.write_attr(&name, Bytes::from(elapsed.as_nanos().to_string()));
    }

    pub fn stamp_stack_time(&mut self, elapsed: Duration) {
        self.write_attr(
            FLTRTIME_ATTR,
            Bytes::from(elapsed.as_nanos().to_string()),
        );
    }
}
