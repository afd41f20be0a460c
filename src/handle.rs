// Versioned handles and registry pools
//
// Every GPU object (resource, shader, PSO) is addressed through a
// generation-checked index into a pool. Freeing a slot bumps its generation,
// so stale handles fail lookup in O(1) instead of dangling.

/// Index + generation pair addressing a slot in a [`HandlePool`].
///
/// The default value is invalid and never matches a live slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawHandle {
    pub index: u32,
    pub generation: u32,
}

impl RawHandle {
    pub const INVALID: RawHandle = RawHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for RawHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
        pub struct $name(pub RawHandle);

        impl $name {
            pub const INVALID: $name = $name(RawHandle::INVALID);

            pub fn is_valid(self) -> bool {
                self.0.is_valid()
            }

            pub fn raw(self) -> RawHandle {
                self.0
            }
        }
    };
}

typed_handle!(
    /// A buffer or texture slot in the device's resource registry.
    ResourceHandle
);
typed_handle!(
    /// Shader bytecode + module slot.
    ShaderHandle
);
typed_handle!(
    /// Graphics or compute pipeline-state slot.
    PsoHandle
);

/// Buffer view over the shared resource registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct BufferHandle(pub ResourceHandle);

/// Texture view over the shared resource registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct TextureHandle(pub ResourceHandle);

impl BufferHandle {
    pub const INVALID: BufferHandle = BufferHandle(ResourceHandle::INVALID);

    pub fn is_valid(self) -> bool {
        self.0.is_valid()
    }

    pub fn resource(self) -> ResourceHandle {
        self.0
    }
}

impl TextureHandle {
    pub const INVALID: TextureHandle = TextureHandle(ResourceHandle::INVALID);

    pub fn is_valid(self) -> bool {
        self.0.is_valid()
    }

    pub fn resource(self) -> ResourceHandle {
        self.0
    }
}

impl From<BufferHandle> for ResourceHandle {
    fn from(h: BufferHandle) -> Self {
        h.0
    }
}

impl From<TextureHandle> for ResourceHandle {
    fn from(h: TextureHandle) -> Self {
        h.0
    }
}

struct Slot<T> {
    generation: u32,
    live: bool,
    data: T,
}

/// Generation-checked index pool.
///
/// Single-threaded discipline: `alloc` hands back a default-initialized slot
/// that the caller finishes filling in before anything else looks it up.
pub struct HandlePool<T: Default> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    num_allocated: u32,
    capacity: u32,
}

impl<T: Default> HandlePool<T> {
    /// `capacity` is a hard budget; exhausting it is a configuration bug.
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            num_allocated: 0,
            capacity,
        }
    }

    pub fn alloc(&mut self) -> (RawHandle, &mut T) {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                assert!(
                    self.slots.len() < self.capacity as usize,
                    "handle pool exhausted (capacity {})",
                    self.capacity
                );
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    live: false,
                    data: T::default(),
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.live);
        slot.live = true;
        slot.data = T::default();
        self.num_allocated += 1;

        (
            RawHandle {
                index,
                generation: slot.generation,
            },
            &mut slot.data,
        )
    }

    pub fn lookup(&self, handle: RawHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then(|| &slot.data)
    }

    pub fn lookup_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then(|| &mut slot.data)
    }

    pub fn is_valid(&self, handle: RawHandle) -> bool {
        self.lookup(handle).is_some()
    }

    /// Invalidates the handle. The slot's generation is bumped so outstanding
    /// copies of the handle fail lookup from here on.
    pub fn free(&mut self, handle: RawHandle) {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .expect("free with out-of-range handle");
        assert!(
            slot.live && slot.generation == handle.generation,
            "free with stale handle (index {}, generation {})",
            handle.index,
            handle.generation
        );
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.data = T::default();
        self.free_list.push(handle.index);
        self.num_allocated -= 1;
    }

    pub fn num_allocated(&self) -> u32 {
        self.num_allocated
    }

    pub fn handle_for_index(&self, index: u32) -> RawHandle {
        let slot = &self.slots[index as usize];
        debug_assert!(slot.live);
        RawHandle {
            index,
            generation: slot.generation,
        }
    }

    /// First live index, for diagnostics enumeration. `None` when empty.
    pub fn first_allocated_index(&self) -> Option<u32> {
        self.next_live_from(0)
    }

    pub fn next_allocated_index(&self, index: u32) -> Option<u32> {
        self.next_live_from(index + 1)
    }

    fn next_live_from(&self, start: u32) -> Option<u32> {
        (start as usize..self.slots.len())
            .find(|&i| self.slots[i].live)
            .map(|i| i as u32)
    }

    /// Iterates every live handle.
    pub fn iter_handles(&self) -> impl Iterator<Item = RawHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, s)| RawHandle {
                index: i as u32,
                generation: s.generation,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq, Debug)]
    struct Payload(u32);

    #[test]
    fn lookup_after_free_is_none() {
        let mut pool = HandlePool::<Payload>::new(8);
        let (h, data) = pool.alloc();
        data.0 = 42;
        assert_eq!(pool.lookup(h), Some(&Payload(42)));

        pool.free(h);
        assert_eq!(pool.lookup(h), None);
        assert!(!pool.is_valid(h));
    }

    #[test]
    fn realloc_same_slot_changes_generation() {
        let mut pool = HandlePool::<Payload>::new(8);
        let (old, _) = pool.alloc();
        pool.free(old);

        let (new, _) = pool.alloc();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(pool.lookup(old).is_none());
        assert!(pool.lookup(new).is_some());
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn double_free_panics() {
        let mut pool = HandlePool::<Payload>::new(8);
        let (h, _) = pool.alloc();
        pool.free(h);
        pool.free(h);
    }

    #[test]
    #[should_panic(expected = "handle pool exhausted")]
    fn exhaustion_panics() {
        let mut pool = HandlePool::<Payload>::new(2);
        let _ = pool.alloc();
        let _ = pool.alloc();
        let _ = pool.alloc();
    }

    #[test]
    fn enumeration_skips_freed_slots() {
        let mut pool = HandlePool::<Payload>::new(8);
        let (a, _) = pool.alloc();
        let (b, _) = pool.alloc();
        let (c, _) = pool.alloc();
        pool.free(b);

        let live: Vec<u32> = pool.iter_handles().map(|h| h.index).collect();
        assert_eq!(live, vec![a.index, c.index]);

        let first = pool.first_allocated_index().unwrap();
        assert_eq!(first, a.index);
        assert_eq!(pool.next_allocated_index(first), Some(c.index));
        assert_eq!(pool.next_allocated_index(c.index), None);
        assert_eq!(pool.num_allocated(), 2);
    }

    #[test]
    fn default_handle_is_invalid() {
        let pool = HandlePool::<Payload>::new(8);
        assert!(!RawHandle::default().is_valid());
        assert!(pool.lookup(RawHandle::default()).is_none());
    }
}
