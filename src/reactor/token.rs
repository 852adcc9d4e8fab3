//! Generation-checked slab for per-watcher binding state.
//!
//! A binding cannot stash a pointer to its watcher state inside the reactor's
//! per-watch user data. It stores a [`SlabToken`] instead and looks the state
//! up when the reactor calls back.
//!
//! # Design
//!
//! The slab uses a free list for O(1) allocation and deallocation. Each token
//! carries a generation counter so that a token left behind by a cleared
//! watcher never resolves to the state of a newer watcher reusing the slot.
//!
//! ```ignore
//! let mut slab = TokenSlab::new();
//! let token = slab.insert(pair);
//!
//! // The reactor hands the packed token back on fire:
//! if let Some(pair) = slab.get(SlabToken::from_usize(raw)) {
//!     // dispatch
//! }
//!
//! slab.remove(token);
//! ```

/// Compact identifier for an occupied slab slot.
///
/// The generation counter ensures that once a slot is freed and reused, stale
/// tokens referring to the old occupant fail to match.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlabToken {
    index: u32,
    generation: u32,
}

impl SlabToken {
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the index portion of the token.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation portion of the token.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the token into a single `u64` for reactor user-data slots.
    ///
    /// The generation is stored in the upper 32 bits and the index in the lower 32 bits.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpacks a value produced by [`to_u64`](Self::to_u64).
    #[must_use]
    pub const fn from_u64(val: u64) -> Self {
        Self {
            index: val as u32,
            generation: (val >> 32) as u32,
        }
    }

    /// Returns an invalid token that will never match any slab entry.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }
}

impl Default for SlabToken {
    fn default() -> Self {
        Self::invalid()
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: u32, generation: u32 },
}

impl<T> Entry<T> {
    fn generation(&self) -> u32 {
        match self {
            Self::Occupied { generation, .. } | Self::Vacant { generation, .. } => *generation,
        }
    }
}

/// Sentinel value indicating end of free list.
const FREE_LIST_END: u32 = u32::MAX;

/// Slab allocator keyed by [`SlabToken`].
///
/// `TokenSlab` is not thread-safe; bindings wrap it in a mutex.
#[derive(Debug)]
pub struct TokenSlab<T> {
    entries: Vec<Entry<T>>,
    free_head: u32,
    len: usize,
}

impl<T> TokenSlab<T> {
    /// Creates a new empty slab.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: FREE_LIST_END,
            len: 0,
        }
    }

    /// Creates a new slab with room for `capacity` entries before reallocating.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_head: FREE_LIST_END,
            len: 0,
        }
    }

    /// Inserts a value and returns its token, reusing a free slot if one exists.
    pub fn insert(&mut self, value: T) -> SlabToken {
        if self.free_head == FREE_LIST_END {
            let index = self.entries.len() as u32;
            self.entries.push(Entry::Occupied {
                value,
                generation: 0,
            });
            self.len += 1;
            return SlabToken::new(index, 0);
        }

        let index = self.free_head;
        let slot = &mut self.entries[index as usize];
        let Entry::Vacant {
            next_free,
            generation,
        } = *slot
        else {
            unreachable!("free list pointed to occupied entry");
        };

        *slot = Entry::Occupied { value, generation };
        self.free_head = next_free;
        self.len += 1;
        SlabToken::new(index, generation)
    }

    /// Returns the value for `token`, or `None` if it is stale or unknown.
    #[must_use]
    pub fn get(&self, token: SlabToken) -> Option<&T> {
        match self.entries.get(token.index as usize)? {
            Entry::Occupied { value, generation } if *generation == token.generation => Some(value),
            _ => None,
        }
    }

    /// Returns the value for `token` mutably, or `None` if it is stale or unknown.
    #[must_use]
    pub fn get_mut(&mut self, token: SlabToken) -> Option<&mut T> {
        match self.entries.get_mut(token.index as usize)? {
            Entry::Occupied { value, generation } if *generation == token.generation => Some(value),
            _ => None,
        }
    }

    /// Removes and returns the value for `token`.
    ///
    /// The slot's generation is bumped so that `token` never matches again.
    pub fn remove(&mut self, token: SlabToken) -> Option<T> {
        let index = token.index as usize;
        let entry = self.entries.get(index)?;
        if entry.generation() != token.generation || matches!(entry, Entry::Vacant { .. }) {
            return None;
        }

        let old = std::mem::replace(
            &mut self.entries[index],
            Entry::Vacant {
                next_free: self.free_head,
                generation: token.generation.wrapping_add(1),
            },
        );
        self.free_head = token.index;
        self.len -= 1;

        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Returns `true` if the token points to an occupied entry.
    #[must_use]
    pub fn contains(&self, token: SlabToken) -> bool {
        self.get(token).is_some()
    }

    /// Returns the number of occupied entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the slab holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes every entry, returning the values in slot order.
    pub fn drain(&mut self) -> Vec<(SlabToken, T)> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if let Entry::Occupied { value, generation } = entry {
                drained.push((SlabToken::new(index as u32, generation), value));
            }
        }
        self.free_head = FREE_LIST_END;
        self.len = 0;
        drained
    }

    /// Iterates over all occupied entries.
    pub fn iter(&self) -> impl Iterator<Item = (SlabToken, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { value, generation } => {
                    Some((SlabToken::new(index as u32, *generation), value))
                }
                Entry::Vacant { .. } => None,
            })
    }
}

impl<T> Default for TokenSlab<T> {
    fn default() -> Self {
        Self::new()
    }
}
