// Copyright 2026 flashkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object cache of the flashkv engine.
//!
//! The cache holds variable-sized objects in fixed-size pages, partitioned into independently locked slabs. Every
//! operation is driven through a coherency table that decides what to do with the backing store and which state the
//! object moves to.

mod backend;
mod cache;
mod config;
mod entry;
mod enumerate;
mod flush;
mod list;
mod page;
mod protocol;
mod slab;
mod stats;

mod prelude;
pub use prelude::*;
