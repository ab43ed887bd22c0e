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

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Seed of the key hash. Changing it reshuffles every bucket.
pub const KEY_HASH_SEED: u64 = 0x5ca1ab1e;

/// Hash an object key scoped by its container.
///
/// The same hash drives bucket selection and the entry syndrome, so both must be derived from this function.
pub fn hash_key(cguid: u64, kind: u8, key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(KEY_HASH_SEED);
    hasher.write_u64(cguid);
    hasher.write_u8(kind);
    hasher.write(key);
    hasher.finish()
}

/// Fingerprint stored with each entry, compared before the full key.
#[inline]
pub fn syndrome(hash: u64) -> u64 {
    hash.rotate_left(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_scoped_by_container() {
        let a = hash_key(1, 0, b"key");
        assert_eq!(a, hash_key(1, 0, b"key"));
        assert_ne!(a, hash_key(2, 0, b"key"));
        assert_ne!(a, hash_key(1, 1, b"key"));
        assert_ne!(a, hash_key(1, 0, b"kez"));
    }

    #[test]
    fn test_syndrome_differs_from_hash() {
        let hash = hash_key(1, 0, b"abc");
        assert_ne!(syndrome(hash), hash);
        assert_eq!(syndrome(hash).rotate_right(32), hash);
    }
}
