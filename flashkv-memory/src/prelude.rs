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

#[cfg(feature = "prometheus")]
pub use flashkv_common::metrics::registry::prometheus::PrometheusMetricsRegistry;
pub use flashkv_common::{
    error::{Error, ErrorKind, Result},
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry, RegistryOps},
};

pub use crate::{
    backend::{Backend, BackendOp, FlushContext, MemoryBackend, StateInitializer},
    cache::{Cache, CacheBuilder, Lookup, Outcome, RemoteRequest, SlabGuard},
    config::CacheConfig,
    entry::{ContainerKind, EntryRef, EntryView, ObjectKey},
    enumerate::{Enumeration, ModifiedCursor, ModifiedObject},
    flush::{BackgroundFlusher, FlushOptions, FlushReport, Token, TokenPool},
    protocol::{
        Action, CacheMode, CacheState, ProtocolTable, Request, Transition, WRITE_BACK, WRITE_BACK_EXPIRED,
        WRITE_THROUGH, WRITE_THROUGH_EXPIRED,
    },
    slab::SlabCounters,
    stats::{CacheStats, SlabStats},
};
