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

//! Fixed-size page run owned by one slab.
//!
//! Pages are carved out of a single allocation made at construction time. The last [`TRAILER_SIZE`] bytes of every
//! page hold the index of the next page in its chain, so free pages and entry pages are linked the same way.

use flashkv_common::strict_assert;

/// Size of the next-page pointer stored at the end of every page.
pub const TRAILER_SIZE: usize = 8;

/// Trailer value that terminates a chain.
pub const NIL: u64 = u64::MAX;

/// A contiguous run of fixed-size pages with an intrusive free list.
pub struct PageArena {
    page_size: usize,
    pages: usize,
    buf: Box<[u8]>,

    free_head: Option<usize>,
    free_pages: usize,
}

impl std::fmt::Debug for PageArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageArena")
            .field("page_size", &self.page_size)
            .field("pages", &self.pages)
            .field("free_head", &self.free_head)
            .field("free_pages", &self.free_pages)
            .finish()
    }
}

impl PageArena {
    /// Allocate `pages` pages of `page_size` bytes and put all of them on the free list.
    pub fn new(page_size: usize, pages: usize) -> Self {
        assert!(page_size > TRAILER_SIZE, "page size must exceed the trailer size");

        let mut arena = Self {
            page_size,
            pages,
            buf: vec![0; page_size * pages].into_boxed_slice(),
            free_head: None,
            free_pages: 0,
        };
        // Push in reverse so the free list pops pages in ascending order.
        for page in (0..pages).rev() {
            arena.push_free(page);
        }
        arena
    }

    /// Bytes of a page usable for data.
    pub fn page_data_size(&self) -> usize {
        self.page_size - TRAILER_SIZE
    }

    /// Total page count of the run.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Pages currently on the free list.
    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// Pages needed to hold `bytes` bytes of data.
    pub fn pages_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.page_data_size()).max(1)
    }

    /// Read the trailer of `page`.
    pub fn next(&self, page: usize) -> Option<usize> {
        let offset = page * self.page_size + self.page_data_size();
        let mut raw = [0u8; TRAILER_SIZE];
        raw.copy_from_slice(&self.buf[offset..offset + TRAILER_SIZE]);
        match u64::from_le_bytes(raw) {
            NIL => None,
            next => Some(next as usize),
        }
    }

    fn set_next(&mut self, page: usize, next: Option<usize>) {
        let offset = page * self.page_size + self.page_data_size();
        let raw = next.map(|p| p as u64).unwrap_or(NIL).to_le_bytes();
        self.buf[offset..offset + TRAILER_SIZE].copy_from_slice(&raw);
    }

    fn data(&self, page: usize) -> &[u8] {
        let start = page * self.page_size;
        &self.buf[start..start + self.page_data_size()]
    }

    fn data_mut(&mut self, page: usize) -> &mut [u8] {
        let start = page * self.page_size;
        let end = start + self.page_data_size();
        &mut self.buf[start..end]
    }

    fn push_free(&mut self, page: usize) {
        self.set_next(page, self.free_head);
        self.free_head = Some(page);
        self.free_pages += 1;
    }

    /// Pop `count` pages off the free list and link them into a chain.
    ///
    /// Returns the head page, or `None` if the free list is too short. The free list is untouched on failure.
    pub fn pop_chain(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free_pages {
            return None;
        }

        let head = self.free_head?;
        let mut tail = head;
        for _ in 1..count {
            tail = self.next(tail)?;
        }
        self.free_head = self.next(tail);
        self.set_next(tail, None);
        self.free_pages -= count;
        Some(head)
    }

    /// Walk the chain starting at `head` and push every page onto the free list.
    ///
    /// Returns the number of pages freed.
    pub fn free_chain(&mut self, head: usize) -> usize {
        let mut freed = 0;
        let mut cursor = Some(head);
        while let Some(page) = cursor {
            strict_assert!(freed < self.pages, "page chain {head} has a cycle");
            cursor = self.next(page);
            self.push_free(page);
            freed += 1;
        }
        freed
    }

    /// Length of the chain starting at `head`, or `None` if the walk runs longer than the run itself.
    pub fn chain_len(&self, head: usize) -> Option<usize> {
        self.chain(head).try_fold(0usize, |len, page| (page < self.pages && len < self.pages).then_some(len + 1))
    }

    /// Iterate over the pages of the chain starting at `head`.
    pub fn chain(&self, head: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(head), move |&page| self.next(page)).take(self.pages + 1)
    }

    /// Iterate over the pages of the free list.
    pub fn free_list(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.free_head, move |&page| self.next(page)).take(self.pages + 1)
    }

    /// Copy `src` into the chain starting at `head`, treating the data areas of its pages as one byte stream.
    pub fn write(&mut self, head: usize, offset: usize, src: &[u8]) {
        let pds = self.page_data_size();
        let mut page = self.seek(head, offset);
        let mut in_page = offset % pds;
        let mut written = 0;
        while written < src.len() {
            let Some(current) = page else {
                strict_assert!(false, "write past the end of chain {head}");
                return;
            };
            let n = (pds - in_page).min(src.len() - written);
            self.data_mut(current)[in_page..in_page + n].copy_from_slice(&src[written..written + n]);
            written += n;
            in_page = 0;
            page = self.next(current);
        }
    }

    /// Copy bytes out of the chain starting at `head` into `dst`.
    pub fn read(&self, head: usize, offset: usize, dst: &mut [u8]) {
        let pds = self.page_data_size();
        let mut page = self.seek(head, offset);
        let mut in_page = offset % pds;
        let mut read = 0;
        while read < dst.len() {
            let Some(current) = page else {
                strict_assert!(false, "read past the end of chain {head}");
                return;
            };
            let n = (pds - in_page).min(dst.len() - read);
            dst[read..read + n].copy_from_slice(&self.data(current)[in_page..in_page + n]);
            read += n;
            in_page = 0;
            page = self.next(current);
        }
    }

    fn seek(&self, head: usize, offset: usize) -> Option<usize> {
        self.chain(head).nth(offset / self.page_data_size())
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_free_list_initialized() {
        let arena = PageArena::new(64, 8);
        assert_eq!(arena.page_data_size(), 56);
        assert_eq!(arena.free_pages(), 8);
        assert_eq!(arena.free_list().collect_vec(), (0..8).collect_vec());
    }

    #[test]
    fn test_pop_and_free_chain() {
        let mut arena = PageArena::new(64, 8);

        let a = arena.pop_chain(3).unwrap();
        assert_eq!(arena.chain(a).collect_vec(), vec![0, 1, 2]);
        assert_eq!(arena.free_pages(), 5);

        let b = arena.pop_chain(5).unwrap();
        assert_eq!(arena.chain_len(b), Some(5));
        assert_eq!(arena.free_pages(), 0);
        assert_eq!(arena.pop_chain(1), None);

        assert_eq!(arena.free_chain(a), 3);
        assert_eq!(arena.free_pages(), 3);
        assert_eq!(arena.pop_chain(4), None);
        assert_eq!(arena.free_pages(), 3);

        assert_eq!(arena.free_chain(b), 5);
        assert_eq!(arena.free_list().count(), 8);
    }

    #[test]
    fn test_pages_for() {
        let arena = PageArena::new(64, 8);
        assert_eq!(arena.pages_for(0), 1);
        assert_eq!(arena.pages_for(56), 1);
        assert_eq!(arena.pages_for(57), 2);
        assert_eq!(arena.pages_for(56 * 3), 3);
    }

    #[test]
    fn test_write_read_across_pages() {
        let mut arena = PageArena::new(64, 8);
        let head = arena.pop_chain(4).unwrap();

        let src = (0..200u8).collect_vec();
        arena.write(head, 10, &src);

        let mut dst = vec![0; 200];
        arena.read(head, 10, &mut dst);
        assert_eq!(src, dst);

        // Trailers are intact after a write that spans page boundaries.
        assert_eq!(arena.chain_len(head), Some(4));
    }
}
