// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary store adapters.
//!
//! - [`memory::InMemoryStore`]: DashMap-backed, for tests and embedding
//! - [`redis::RedisStore`]: Redis strings, optionally namespaced by prefix

pub mod traits;
pub mod memory;
pub mod redis;
