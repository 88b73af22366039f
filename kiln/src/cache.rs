//! Inline caches: a fixed-capacity, FIFO-reused table of dispatch-site
//! patches. Sites are keyed by (method, pc) in a side index rather than by
//! rewriting code bytes, so every patch is reversible at any moment: when
//! the table wraps around, the oldest site is unpatched before its slot is
//! reused, and the whole table can be flushed (debugger breakpoints,
//! disabling the optimization).
//!
//! Cached contents are class/method/field ids only, never a heap
//! reference the collector could move.

use ahash::AHashMap;

use crate::class::{ClassId, FieldId, MethodId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CodeLoc {
    pub method: MethodId,
    pub pc: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheContents {
    /// Monomorphic virtual or interface dispatch: valid while the receiver
    /// class matches `expected`.
    VirtualMethod { expected: ClassId, target: MethodId },
    StaticMethod(MethodId),
    SpecialMethod(MethodId),
    InstanceField(FieldId),
    StaticField(FieldId),
}

#[derive(Debug, Copy, Clone)]
pub struct CacheEntry {
    pub contents: CacheContents,
    pub site: CodeLoc,
    /// Opcode and operand the fast path stands in for; eviction and flush
    /// fall back to exactly this.
    pub original: (u8, u16),
}

#[derive(Debug)]
pub struct InlineCache {
    entries: Vec<Option<CacheEntry>>,
    sites: AHashMap<CodeLoc, u16>,
    /// Next slot to hand out; wraps FIFO.
    next: usize,
    enabled: bool,
    evictions: u64,
}

impl InlineCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            sites: AHashMap::new(),
            next: 0,
            enabled: true,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn lookup(&self, site: CodeLoc) -> Option<&CacheEntry> {
        if !self.enabled {
            return None;
        }
        let index = *self.sites.get(&site)?;
        self.entries[index as usize].as_ref()
    }

    /// Record `contents` for `site`. A site that is already patched is
    /// updated in place (monomorphic repatch); otherwise the oldest slot
    /// is unpatched and reused.
    pub fn create(&mut self, contents: CacheContents, site: CodeLoc, original: (u8, u16)) {
        if !self.enabled {
            return;
        }
        if let Some(&index) = self.sites.get(&site) {
            let entry = self.entries[index as usize]
                .as_mut()
                .expect("site index points at empty slot");
            debug_assert_eq!(entry.original, original, "site changed identity");
            entry.contents = contents;
            return;
        }
        let index = self.next;
        self.next = (self.next + 1) % self.entries.len();
        if let Some(old) = self.entries[index].take() {
            // Reversibility: the evicted site falls back to its original
            // opcode+operand before the slot is reused.
            self.sites.remove(&old.site);
            self.evictions += 1;
        }
        self.entries[index] = Some(CacheEntry {
            contents,
            site,
            original,
        });
        self.sites.insert(site, index as u16);
    }

    /// The original opcode+operand recorded for a still-patched site.
    pub fn original_at(&self, site: CodeLoc) -> Option<(u8, u16)> {
        let index = *self.sites.get(&site)?;
        self.entries[index as usize].map(|e| e.original)
    }

    /// Unpatch everything. Used before handing dispatch sites to a
    /// debugger and by `set_enabled(false)`.
    pub fn flush(&mut self) {
        for slot in &mut self.entries {
            *slot = None;
        }
        self.sites.clear();
        self.next = 0;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.flush();
        }
        self.enabled = enabled;
    }

    pub fn patched_sites(&self) -> usize {
        self.sites.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(pc: u32) -> CodeLoc {
        CodeLoc {
            method: MethodId {
                class: ClassId(1),
                index: 0,
            },
            pc,
        }
    }

    fn static_target(i: u16) -> CacheContents {
        CacheContents::StaticMethod(MethodId {
            class: ClassId(2),
            index: i,
        })
    }

    #[test]
    fn create_then_lookup_hits() {
        let mut cache = InlineCache::new(4);
        cache.create(static_target(3), site(10), (0xb8, 7));
        let entry = cache.lookup(site(10)).expect("cached");
        assert_eq!(entry.contents, static_target(3));
        assert_eq!(entry.original, (0xb8, 7));
        assert!(cache.lookup(site(11)).is_none());
    }

    #[test]
    fn wraparound_unpatches_fifo_order() {
        let capacity = 4;
        let mut cache = InlineCache::new(capacity);
        let total = capacity * 2 + 1;
        for i in 0..total {
            cache.create(static_target(i as u16), site(i as u32), (0xb8, i as u16));
        }
        // Only the newest `capacity` sites stay patched.
        assert_eq!(cache.patched_sites(), capacity);
        assert_eq!(cache.evictions() as usize, total - capacity);
        for i in 0..total - capacity {
            assert!(
                cache.lookup(site(i as u32)).is_none(),
                "evicted site {i} must fall back to the slow path"
            );
        }
        // Every still-tracked site reports its exact original bytes.
        for i in total - capacity..total {
            assert_eq!(cache.original_at(site(i as u32)), Some((0xb8, i as u16)));
        }
    }

    #[test]
    fn repatching_a_site_updates_in_place() {
        let mut cache = InlineCache::new(2);
        cache.create(static_target(1), site(5), (0xb6, 9));
        cache.create(static_target(2), site(5), (0xb6, 9));
        assert_eq!(cache.patched_sites(), 1);
        assert_eq!(
            cache.lookup(site(5)).unwrap().contents,
            static_target(2),
            "repatch must replace contents, not add a slot"
        );
    }

    #[test]
    fn flush_restores_every_site() {
        let mut cache = InlineCache::new(8);
        for i in 0..6 {
            cache.create(static_target(i), site(i as u32), (0xb8, i));
        }
        cache.flush();
        assert_eq!(cache.patched_sites(), 0);
        for i in 0..6 {
            assert!(cache.lookup(site(i as u32)).is_none());
        }
    }

    #[test]
    fn disabling_flushes_and_stops_caching() {
        let mut cache = InlineCache::new(4);
        cache.create(static_target(0), site(0), (0xb8, 0));
        cache.set_enabled(false);
        assert!(cache.lookup(site(0)).is_none());
        cache.create(static_target(1), site(1), (0xb8, 1));
        assert_eq!(cache.patched_sites(), 0);
        cache.set_enabled(true);
        cache.create(static_target(1), site(1), (0xb8, 1));
        assert!(cache.lookup(site(1)).is_some());
    }
}
