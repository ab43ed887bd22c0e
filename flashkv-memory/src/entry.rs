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

use bitflags::bitflags;
use flashkv_common::hasher::{hash_key, syndrome};
use serde::{Deserialize, Serialize};

use crate::{list::Link, protocol::CacheState};

/// Size of the header written at the start of the first page of every entry.
pub const HEADER_SIZE: usize = 40;

/// Kind of the container an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Object container, variable-sized values.
    Object,
    /// Block container, fixed-sized values.
    Block,
}

impl From<ContainerKind> for u8 {
    fn from(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::Object => 0,
            ContainerKind::Block => 1,
        }
    }
}

impl TryFrom<u8> for ContainerKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Object),
            1 => Ok(Self::Block),
            v => Err(v),
        }
    }
}

/// Key of a cached object, scoped by its container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Container id.
    pub cguid: u64,
    /// Container kind.
    pub kind: ContainerKind,
    /// Raw key bytes.
    pub key: Vec<u8>,
}

impl ObjectKey {
    /// Create an object key.
    pub fn new(cguid: u64, kind: ContainerKind, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cguid,
            kind,
            key: key.into(),
        }
    }

    /// Hash of the key, used for bucket selection.
    pub fn hash(&self) -> u64 {
        hash_key(self.cguid, self.kind.into(), &self.key)
    }

    /// Fingerprint stored in the entry and compared before the key bytes.
    pub fn syndrome(&self) -> u64 {
        syndrome(self.hash())
    }
}

bitflags! {
    /// Per-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// Not linked into any bucket or list yet.
        const TRANSIENT = 0b0000_0001;
        /// Already returned by the running enumeration pass.
        const ENUMERATED = 0b0000_0010;
    }
}

/// Handle of an entry.
///
/// The head page index is the identity of the entry within its slab, and the generation detects handles that outlived
/// their entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef {
    pub(crate) slab: usize,
    pub(crate) page: usize,
    pub(crate) generation: u64,
}

impl EntryRef {
    /// Index of the slab that owns the entry.
    pub fn slab(&self) -> usize {
        self.slab
    }
}

/// On-page header of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub key_len: u32,
    pub obj_size: u32,
    pub cguid: u64,
    pub syndrome: u64,
    pub created: u32,
    pub expiry: u32,
    pub kind: u8,
}

impl EntryHeader {
    pub fn write(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&self.key_len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.obj_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.cguid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.syndrome.to_le_bytes());
        buf[24..28].copy_from_slice(&self.created.to_le_bytes());
        buf[28..32].copy_from_slice(&self.expiry.to_le_bytes());
        buf[32] = self.kind;
        buf[33..HEADER_SIZE].fill(0);
    }

    pub fn read(buf: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Self {
            key_len: u32_at(0),
            obj_size: u32_at(4),
            cguid: u64_at(8),
            syndrome: u64_at(16),
            created: u32_at(24),
            expiry: u32_at(28),
            kind: buf[32],
        }
    }

    /// Bytes occupied by header, key and value.
    pub fn footprint(&self) -> usize {
        HEADER_SIZE + self.key_len as usize + self.obj_size as usize
    }
}

/// In-slab metadata of an entry, indexed by its head page.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub generation: u64,
    pub state: CacheState,
    pub flags: EntryFlags,

    pub header: EntryHeader,
    pub kind: ContainerKind,

    pub bucket: usize,
    pub next_in_bucket: Option<usize>,

    pub lru: Link,
    pub modlru: Link,

    pub pages: usize,
}

impl EntryMeta {
    pub fn key_len(&self) -> usize {
        self.header.key_len as usize
    }

    pub fn obj_size(&self) -> usize {
        self.header.obj_size as usize
    }

    /// Key and value bytes, the unit of every byte counter.
    pub fn size_w_key(&self) -> usize {
        self.key_len() + self.obj_size()
    }

    pub fn is_transient(&self) -> bool {
        self.flags.contains(EntryFlags::TRANSIENT)
    }

    /// Whether the expiry applies at `now`.
    pub fn is_expired(&self, now: u32) -> bool {
        self.header.expiry != 0 && self.header.expiry <= now
    }
}

/// Owned snapshot of an entry, handed to backend callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    /// Key of the entry.
    pub key: ObjectKey,
    /// Value bytes.
    pub value: Vec<u8>,
    /// Coherency state at the time of the snapshot.
    pub state: CacheState,
    /// Creation time.
    pub created: u32,
    /// Expiry time, `0` for never.
    pub expiry: u32,
}
