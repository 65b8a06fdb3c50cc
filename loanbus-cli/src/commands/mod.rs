// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod down;
pub mod publish;
pub mod stats;
pub mod subscribe;
pub mod up;
pub mod validate;
