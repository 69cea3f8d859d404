// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod dag;
pub mod opt;
pub mod spec;
pub mod stats;
