//! Generic inline caches.
//!
//! Each call site keeps a singly linked list of entries, newest first. An
//! entry owns a small piece of JIT memory that the emitted code fills with
//! its specialized fast path. Entries are never removed; they go away with
//! the arena that owns them.

use super::codegen::JitError;
use super::context::JitContext;
use super::memory::JitRegion;

/// Maximum number of entries per call site.
pub const MAX_ENTRIES_PER_SITE: u8 = 5;

/// Cache state of one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing recorded yet
    Uninitialized,
    /// One entry
    Monomorphic,
    /// More than one entry, still room for more
    Polymorphic,
    /// At the cap, no more entries can be added
    Full,
}

/// Handle of an entry inside an [`IcArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcEntryId(u32);

#[derive(Debug)]
pub struct IcEntry {
    pub trait_kind: u16,
    /// Size class of `code`
    pub stepping: u8,
    prev: Option<IcEntryId>,
    code: JitRegion,
}

impl IcEntry {
    pub fn prev(&self) -> Option<IcEntryId> {
        self.prev
    }

    pub fn jit_addr(&self) -> usize {
        self.code.addr()
    }

    pub fn code(&self) -> &[u8] {
        self.code.as_slice()
    }

    pub fn code_mut(&mut self) -> &mut [u8] {
        self.code.as_mut_slice()
    }
}

/// Owns the entries of every site of one compilation unit.
#[derive(Debug, Default)]
pub struct IcArena {
    entries: Vec<IcEntry>,
}

impl IcArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: IcEntryId) -> &IcEntry {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: IcEntryId) -> &mut IcEntry {
        &mut self.entries[id.0 as usize]
    }

    fn push(&mut self, entry: IcEntry) -> IcEntryId {
        let id = IcEntryId(u32::try_from(self.entries.len()).unwrap_or(u32::MAX));
        assert!(id.0 != u32::MAX, "too many inline cache entries");
        self.entries.push(entry);
        id
    }
}

/// Inline cache of a single call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenericIcSite {
    head: Option<IcEntryId>,
    num_entries: u8,
}

impl GenericIcSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_entries(&self) -> u8 {
        self.num_entries
    }

    pub fn state(&self) -> CacheState {
        match self.num_entries {
            0 => CacheState::Uninitialized,
            1 => CacheState::Monomorphic,
            n if n < MAX_ENTRIES_PER_SITE => CacheState::Polymorphic,
            _ => CacheState::Full,
        }
    }

    /// Add an entry for `trait_kind` and return it so the caller can fill in its code.
    ///
    /// Panics if the site is full.
    pub fn insert<'a>(
        &mut self,
        ctx: &JitContext,
        arena: &'a mut IcArena,
        trait_kind: u16,
    ) -> Result<&'a mut IcEntry, JitError> {
        assert!(
            self.num_entries < MAX_ENTRIES_PER_SITE,
            "inline cache site already holds {} entries",
            self.num_entries
        );
        let stepping = ctx.trait_tables().ic_stepping(trait_kind);
        let code = ctx.allocator().allocate_given_stepping(stepping)?;
        let id = arena.push(IcEntry {
            trait_kind,
            stepping,
            prev: self.head,
            code,
        });
        self.head = Some(id);
        self.num_entries += 1;
        Ok(arena.get_mut(id))
    }

    /// Entries from newest to oldest.
    pub fn entries<'a>(&self, arena: &'a IcArena) -> impl Iterator<Item = &'a IcEntry> + 'a {
        std::iter::successors(self.head.map(|id| arena.get(id)), move |e| {
            e.prev.map(|id| arena.get(id))
        })
    }
}
