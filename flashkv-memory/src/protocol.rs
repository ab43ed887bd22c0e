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

//! Coherency protocol tables.
//!
//! Every cache operation is driven through a `(request, state) -> (action, next state)` table. Four tables exist,
//! selected by the cache mode and by whether the expiry of the resident object applies.

use serde::{Deserialize, Serialize};

/// Coherency state of an entry relative to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    /// Not cached.
    Invalid,
    /// Clean copy, identical to the backing store.
    Shared,
    /// Dirty copy, not persisted yet.
    Modified,
    /// Protocol violation sentinel.
    Bad,
}

impl CacheState {
    /// All states, in table column order.
    pub const ALL: [CacheState; 4] = [Self::Invalid, Self::Shared, Self::Modified, Self::Bad];

    fn column(self) -> usize {
        self as usize
    }
}

/// Request types accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Request {
    /// Create an object that must not exist yet.
    Create,
    /// Create or replace an object.
    Put,
    /// Read an object.
    Get,
    /// Delete an object from the cache and the backing store.
    Delete,
    /// Persist a dirty object and keep it cached.
    Flush,
    /// Drop an object from the cache without persisting it.
    Invalidate,
    /// Persist a dirty object, then drop it.
    FlushInvalidate,
    /// A peer pushed a new value.
    RemoteUpdate,
    /// A peer asked to drop the cached copy.
    RemoteInvalidate,
    /// A peer asked to persist the cached copy.
    RemoteFlush,
}

impl Request {
    /// All requests, in table row order.
    pub const ALL: [Request; 10] = [
        Self::Create,
        Self::Put,
        Self::Get,
        Self::Delete,
        Self::Flush,
        Self::Invalidate,
        Self::FlushInvalidate,
        Self::RemoteUpdate,
        Self::RemoteInvalidate,
        Self::RemoteFlush,
    ];

    /// Whether the request originates from a peer and goes through the deferred queue.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::RemoteUpdate | Self::RemoteInvalidate | Self::RemoteFlush)
    }

    fn row(self) -> usize {
        self as usize
    }
}

/// Primitive executed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Nothing to do.
    Noop,
    /// Copy the value out of the cache.
    Serve,
    /// Read the value from the backing store into the cache.
    Fill,
    /// Store the payload in the cache only.
    WriteBack,
    /// Store the payload in the cache and persist it.
    WriteThrough,
    /// Persist the cached value.
    Flush,
    /// Drop the cached value without persisting it.
    Invalidate,
    /// Persist the cached value, then drop it.
    FlushInvalidate,
    /// Delete from the backing store and drop the cached value.
    Delete,
    /// The cached value has expired. Delete it everywhere.
    Expire,
    /// Store a remote payload as a clean copy.
    Install,
    /// Reject the creation of an existing object.
    Exists,
    /// Protocol violation.
    Bad,
}

/// One table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Primitive to execute.
    pub action: Action,
    /// State of the entry after the action.
    pub next: CacheState,
}

const fn t(action: Action, next: CacheState) -> Transition {
    Transition { action, next }
}

/// A complete `(request, state)` table.
#[derive(Debug)]
pub struct ProtocolTable {
    name: &'static str,
    cells: [[Transition; 4]; 10],
}

impl ProtocolTable {
    /// Name of the table, used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up the cell of `(request, state)`.
    pub fn lookup(&self, request: Request, state: CacheState) -> Transition {
        self.cells[request.row()][state.column()]
    }
}

use Action as A;
use CacheState::{Bad as B, Invalid as I, Modified as M, Shared as S};

const BAD: Transition = t(A::Bad, B);

/// Write-back mode, object not expired.
pub static WRITE_BACK: ProtocolTable = ProtocolTable {
    name: "write-back",
    cells: [
        // Create
        [t(A::WriteBack, M), t(A::Exists, S), t(A::Exists, M), BAD],
        // Put
        [t(A::WriteBack, M), t(A::WriteBack, M), t(A::WriteBack, M), BAD],
        // Get
        [t(A::Fill, S), t(A::Serve, S), t(A::Serve, M), BAD],
        // Delete
        [t(A::Delete, I), t(A::Delete, I), t(A::Delete, I), BAD],
        // Flush
        [t(A::Noop, I), t(A::Noop, S), t(A::Flush, S), BAD],
        // Invalidate
        [t(A::Noop, I), t(A::Invalidate, I), t(A::Invalidate, I), BAD],
        // FlushInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), t(A::FlushInvalidate, I), BAD],
        // RemoteUpdate
        [t(A::Install, S), t(A::Install, S), BAD, BAD],
        // RemoteInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), t(A::Invalidate, I), BAD],
        // RemoteFlush
        [t(A::Noop, I), t(A::Noop, S), t(A::Flush, S), BAD],
    ],
};

/// Write-back mode, object present and past its expiry.
pub static WRITE_BACK_EXPIRED: ProtocolTable = ProtocolTable {
    name: "write-back-expired",
    cells: [
        // Create
        [t(A::WriteBack, M), t(A::WriteBack, M), t(A::WriteBack, M), BAD],
        // Put
        [t(A::WriteBack, M), t(A::WriteBack, M), t(A::WriteBack, M), BAD],
        // Get
        [t(A::Fill, S), t(A::Expire, I), t(A::Expire, I), BAD],
        // Delete
        [t(A::Delete, I), t(A::Delete, I), t(A::Delete, I), BAD],
        // Flush
        [t(A::Noop, I), t(A::Expire, I), t(A::Expire, I), BAD],
        // Invalidate
        [t(A::Noop, I), t(A::Invalidate, I), t(A::Invalidate, I), BAD],
        // FlushInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), t(A::Invalidate, I), BAD],
        // RemoteUpdate
        [t(A::Install, S), t(A::Install, S), BAD, BAD],
        // RemoteInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), t(A::Invalidate, I), BAD],
        // RemoteFlush
        [t(A::Noop, I), t(A::Noop, S), t(A::Expire, I), BAD],
    ],
};

/// Write-through mode, object not expired. No entry is ever dirty.
pub static WRITE_THROUGH: ProtocolTable = ProtocolTable {
    name: "write-through",
    cells: [
        // Create
        [t(A::WriteThrough, S), t(A::Exists, S), BAD, BAD],
        // Put
        [t(A::WriteThrough, S), t(A::WriteThrough, S), BAD, BAD],
        // Get
        [t(A::Fill, S), t(A::Serve, S), BAD, BAD],
        // Delete
        [t(A::Delete, I), t(A::Delete, I), BAD, BAD],
        // Flush
        [t(A::Noop, I), t(A::Noop, S), BAD, BAD],
        // Invalidate
        [t(A::Noop, I), t(A::Invalidate, I), BAD, BAD],
        // FlushInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), BAD, BAD],
        // RemoteUpdate
        [t(A::Install, S), t(A::Install, S), BAD, BAD],
        // RemoteInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), BAD, BAD],
        // RemoteFlush
        [t(A::Noop, I), t(A::Noop, S), BAD, BAD],
    ],
};

/// Write-through mode, object present and past its expiry.
pub static WRITE_THROUGH_EXPIRED: ProtocolTable = ProtocolTable {
    name: "write-through-expired",
    cells: [
        // Create
        [t(A::WriteThrough, S), t(A::WriteThrough, S), BAD, BAD],
        // Put
        [t(A::WriteThrough, S), t(A::WriteThrough, S), BAD, BAD],
        // Get
        [t(A::Fill, S), t(A::Expire, I), BAD, BAD],
        // Delete
        [t(A::Delete, I), t(A::Delete, I), BAD, BAD],
        // Flush
        [t(A::Noop, I), t(A::Expire, I), BAD, BAD],
        // Invalidate
        [t(A::Noop, I), t(A::Invalidate, I), BAD, BAD],
        // FlushInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), BAD, BAD],
        // RemoteUpdate
        [t(A::Install, S), t(A::Install, S), BAD, BAD],
        // RemoteInvalidate
        [t(A::Noop, I), t(A::Invalidate, I), BAD, BAD],
        // RemoteFlush
        [t(A::Noop, I), t(A::Noop, S), BAD, BAD],
    ],
};

/// Write policy of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CacheMode {
    /// Writes mark entries dirty. Persisting is deferred to eviction, flush or the background flusher.
    #[default]
    WriteBack,
    /// Writes are persisted before they return. Entries are never dirty.
    WriteThrough,
}

impl CacheMode {
    /// Select the table for this mode.
    pub fn table(self, expired: bool) -> &'static ProtocolTable {
        match (self, expired) {
            (CacheMode::WriteBack, false) => &WRITE_BACK,
            (CacheMode::WriteBack, true) => &WRITE_BACK_EXPIRED,
            (CacheMode::WriteThrough, false) => &WRITE_THROUGH,
            (CacheMode::WriteThrough, true) => &WRITE_THROUGH_EXPIRED,
        }
    }

    /// State a freshly promoted entry gets unless a custom initializer is installed.
    pub fn initial_state(self) -> CacheState {
        match self {
            CacheMode::WriteBack => CacheState::Modified,
            CacheMode::WriteThrough => CacheState::Shared,
        }
    }
}
