//! Component bitset.
//!
//! HPM.1 addresses at most eight firmware components per controller and
//! encodes any selection of them as a single byte.

use std::fmt;

use crate::protocol::constants::MAX_COMPONENTS;

/// Fixed 8-bit set of component ids (0..=7).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComponentSet(u8);

impl ComponentSet {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Set containing only `id`. Ids outside 0..=7 yield the empty set.
    pub fn single(id: u8) -> Self {
        if id < MAX_COMPONENTS {
            Self(1 << id)
        } else {
            Self::EMPTY
        }
    }

    pub fn contains(&self, id: u8) -> bool {
        id < MAX_COMPONENTS && self.0 & (1 << id) != 0
    }

    pub fn insert(&mut self, id: u8) {
        if id < MAX_COMPONENTS {
            self.0 |= 1 << id;
        }
    }

    pub fn remove(&mut self, id: u8) {
        if id < MAX_COMPONENTS {
            self.0 &= !(1 << id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_subset_of(&self, other: ComponentSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersection(&self, other: ComponentSet) -> ComponentSet {
        Self(self.0 & other.0)
    }

    /// Members of `self` missing from `other`.
    pub fn difference(&self, other: ComponentSet) -> ComponentSet {
        Self(self.0 & !other.0)
    }

    /// Lowest component id in the set.
    pub fn lowest(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    /// Component ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_COMPONENTS).filter(move |id| self.contains(*id))
    }
}

impl From<u8> for ComponentSet {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentSet(0x{:02X} {})", self.0, self)
    }
}

impl fmt::Display for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_ops() {
        let mut set = ComponentSet::EMPTY;
        set.insert(0);
        set.insert(3);
        set.insert(9); // ignored
        assert_eq!(set.bits(), 0b0000_1001);
        assert_eq!(set.len(), 2);
        assert_eq!(set.lowest(), Some(0));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(set.to_string(), "{0,3}");

        let caps = ComponentSet::from_bits(0b0000_0111);
        assert!(!set.is_subset_of(caps));
        assert_eq!(set.difference(caps), ComponentSet::single(3));
        assert_eq!(set.intersection(caps), ComponentSet::single(0));
    }

    #[test]
    fn test_empty_lowest() {
        assert_eq!(ComponentSet::EMPTY.lowest(), None);
        assert_eq!(ComponentSet::EMPTY.to_string(), "{}");
    }
}
