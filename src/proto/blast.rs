// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The object-blast payload: one passing object shipped to the client.
//!
//! With a thumbnail set configured the body slot stays empty and the
//! attribute list is restricted to that set (plus the object id);
//! otherwise the body ships along with every non-omitted attribute.

use serde::{Deserialize, Serialize};

use crate::{
    object::{AttrFlags, Object},
    proto::control::NamedAttr,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct BlastObject {
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<NamedAttr>,
    pub attrs: Vec<NamedAttr>,
}

impl BlastObject {
    /// Package an object for the client under the current thumbnail set.
    pub fn package(obj: &Object, push_attrs: Option<&[String]>) -> Self {
        let object_id = obj.id_sig().to_string();

        match push_attrs {
            Some(thumbnail) => {
                let attrs = obj
                    .iter_attrs()
                    .filter(|(name, _)| thumbnail.iter().any(|t| t.as_str() == *name))
                    .map(|(name, attr)| NamedAttr {
                        name: name.to_string(),
                        data: attr.data.to_vec(),
                    })
                    .collect();
                Self {
                    object_id,
                    body: None,
                    attrs,
                }
            },
            None => {
                let attrs = obj
                    .iter_attrs()
                    .filter(|(name, _)| !name.is_empty())
                    .filter(|(_, attr)| !attr.flags.contains(AttrFlags::OMIT))
                    .map(|(name, attr)| NamedAttr {
                        name: name.to_string(),
                        data: attr.data.to_vec(),
                    })
                    .collect();
                Self {
                    object_id,
                    body: obj.body().map(|data| NamedAttr {
                        name: String::new(),
                        data: data.to_vec(),
                    }),
                    attrs,
                }
            },
        }
    }
}
