use super::id_pool::IdPool;

/// Stable handle into an [`Arena`]. The generation makes handles to released slots detectably stale.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ArenaHandle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Clone, Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with recycled indices and generation-checked handles.
///
/// Releasing a slot bumps its generation, so any handle still pointing at it resolves to `None`
/// instead of silently aliasing whatever gets inserted there next.
#[derive(Clone, Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    id_pool: IdPool,
    count: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            id_pool: IdPool::default(),
            count: 0,
        }
    }
}

impl<T> Arena<T> {
    /// Gets the number of live values.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inserts a value, reusing a released slot if one is available.
    pub fn insert(&mut self, value: T) -> ArenaHandle {
        let index = self.id_pool.take();
        if index as usize == self.slots.len() {
            self.slots.push(Slot {
                generation: 0,
                value: None,
            });
        }
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.value.is_none(), "Id pool handed out a live slot.");
        slot.value = Some(value);
        self.count += 1;
        ArenaHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Removes the value behind `handle`. Stale handles are ignored and return `None`.
    pub fn remove(&mut self, handle: ArenaHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.id_pool.return_id(handle.index);
        self.count -= 1;
        Some(value)
    }

    #[inline(always)]
    pub fn get(&self, handle: ArenaHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, handle: ArenaHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    #[inline(always)]
    pub fn contains(&self, handle: ArenaHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Iterates live values with their handles in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ArenaHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Iterates live values mutably in slot order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }

    /// Releases every slot, invalidating all outstanding handles.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.id_pool.return_id(index as u32);
            }
        }
        self.count = 0;
    }
}
