//! Atomic request building.

use std::collections::HashMap;

use tracing::warn;

use super::{KmsDevice, KmsError, ObjectKind};

pub const PAGE_FLIP_EVENT: u32 = 0x01;
pub const ATOMIC_NONBLOCK: u32 = 0x0200;
pub const ATOMIC_ALLOW_MODESET: u32 = 0x0400;

/// Flags passed to `DRM_IOCTL_MODE_ATOMIC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags(pub u32);

impl CommitFlags {
    pub const PAGE_FLIP_EVENT: CommitFlags = CommitFlags(PAGE_FLIP_EVENT);
    pub const ALLOW_MODESET: CommitFlags = CommitFlags(ATOMIC_ALLOW_MODESET);

    pub fn contains(self, other: CommitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommitFlags {
    type Output = CommitFlags;

    fn bitor(self, rhs: CommitFlags) -> CommitFlags {
        CommitFlags(self.0 | rhs.0)
    }
}

/// A set of property writes applied together by one atomic commit.
///
/// Writes keep insertion order per object; writing the same property twice
/// keeps the last value, as libdrm does.
#[derive(Debug, Clone, Default)]
pub struct AtomicRequest {
    writes: Vec<(u32, u32, u64)>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: u32, property: u32, value: u64) {
        if let Some(slot) = self
            .writes
            .iter_mut()
            .find(|(o, p, _)| *o == object && *p == property)
        {
            slot.2 = value;
        } else {
            self.writes.push((object, property, value));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[(u32, u32, u64)] {
        &self.writes
    }

    /// Writes grouped by object in first-seen object order, the layout the
    /// kernel interface expects.
    pub fn grouped(&self) -> Vec<(u32, Vec<(u32, u64)>)> {
        let mut groups: Vec<(u32, Vec<(u32, u64)>)> = Vec::new();
        for &(object, prop, value) in &self.writes {
            match groups.iter_mut().find(|(o, _)| *o == object) {
                Some((_, props)) => props.push((prop, value)),
                None => groups.push((object, vec![(prop, value)])),
            }
        }
        groups
    }
}

/// Property name to id table of one mode object, read once at setup.
#[derive(Debug, Clone)]
pub struct ObjectProps {
    pub id: u32,
    pub kind: ObjectKind,
    ids: HashMap<String, u32>,
}

impl ObjectProps {
    pub fn load(card: &dyn KmsDevice, id: u32, kind: ObjectKind) -> Result<Self, KmsError> {
        let ids = card
            .properties(id, kind)?
            .into_iter()
            .map(|p| (p.name, p.id))
            .collect();
        Ok(Self { id, kind, ids })
    }

    pub fn has(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }

    pub fn prop_id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Queue a write of `name` on this object. Unknown properties are logged
    /// and skipped; the rest of the request still goes out.
    pub fn set(&self, req: &mut AtomicRequest, name: &str, value: u64) {
        match self.ids.get(name) {
            Some(&prop) => req.add(self.id, prop, value),
            None => warn!(
                "{} {} has no property '{}', skipping",
                self.kind.name(),
                self.id,
                name
            ),
        }
    }

    /// Read back the value the hardware currently has programmed.
    pub fn current(&self, card: &dyn KmsDevice, name: &str) -> Result<u64, KmsError> {
        card.property_value(self.id, self.kind, name)?
            .ok_or_else(|| KmsError::MissingProperty {
                object: self.id,
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_write_keeps_last_value() {
        let mut req = AtomicRequest::new();
        req.add(31, 7, 1);
        req.add(40, 7, 5);
        req.add(31, 7, 2);
        assert_eq!(req.len(), 2);
        assert_eq!(req.writes()[0], (31, 7, 2));
    }

    #[test]
    fn grouped_keeps_object_order() {
        let mut req = AtomicRequest::new();
        req.add(40, 1, 10);
        req.add(31, 2, 20);
        req.add(40, 3, 30);
        let groups = req.grouped();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], (40, vec![(1, 10), (3, 30)]));
        assert_eq!(groups[1], (31, vec![(2, 20)]));
    }

    #[test]
    fn flags_combine() {
        let flags = CommitFlags::PAGE_FLIP_EVENT | CommitFlags::ALLOW_MODESET;
        assert!(flags.contains(CommitFlags::PAGE_FLIP_EVENT));
        assert!(flags.contains(CommitFlags::ALLOW_MODESET));
        assert!(!CommitFlags::default().contains(CommitFlags::PAGE_FLIP_EVENT));
    }
}
