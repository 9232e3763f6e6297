// SPDX-License-Identifier: MPL-2.0

//! Sets of CPU IDs, used to address cross-call targets.

use bit_field::BitField;
use smallvec::SmallVec;

use super::CpuId;

/// A set of CPUs, stored as a growable bitmap.
///
/// Machines of up to 128 CPUs stay inline; larger ones spill to the heap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet {
    words: SmallVec<[u64; NR_INLINE_WORDS]>,
}

const WORD_BITS: usize = u64::BITS as usize;
const NR_INLINE_WORDS: usize = 2;

const fn split(cpu_id: CpuId) -> (usize, usize) {
    (
        cpu_id.as_usize() / WORD_BITS,
        cpu_id.as_usize() % WORD_BITS,
    )
}

impl CpuSet {
    /// Creates an empty set.
    pub fn new_empty() -> Self {
        Self {
            words: SmallVec::new(),
        }
    }

    /// Creates the set containing CPUs `0..num_cpus`.
    pub fn new_full(num_cpus: usize) -> Self {
        let mut set = Self::new_empty();
        for id in 0..num_cpus {
            set.add(CpuId::new(id as u32));
        }
        set
    }

    /// Adds a CPU to the set.
    pub fn add(&mut self, cpu_id: CpuId) {
        let (word, bit) = split(cpu_id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word].set_bit(bit, true);
    }

    /// Removes a CPU from the set.
    pub fn remove(&mut self, cpu_id: CpuId) {
        let (word, bit) = split(cpu_id);
        if let Some(w) = self.words.get_mut(word) {
            w.set_bit(bit, false);
        }
    }

    /// Returns whether the set contains the given CPU.
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        let (word, bit) = split(cpu_id);
        self.words.get(word).is_some_and(|w| w.get_bit(bit))
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterates over the CPUs in the set, in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.words.iter().enumerate().flat_map(|(word, &w)| {
            (0..WORD_BITS)
                .filter(move |bit| w.get_bit(*bit))
                .map(move |bit| CpuId::new((word * WORD_BITS + bit) as u32))
        })
    }
}
