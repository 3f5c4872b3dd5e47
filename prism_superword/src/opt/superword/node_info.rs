//! Per-node analysis records, indexed by block position.

use super::pack::PackId;
use crate::ir::types::BasicType;
use std::fmt;

// =============================================================================
// Alignment
// =============================================================================

/// Byte offset of a memory reference modulo the vector width.
///
/// `Top` means no constraint has been derived yet; `Bottom` means the
/// reference can never sit at a lane boundary. Both are distinct from a
/// computed `Offset(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Alignment {
    #[default]
    Top,
    Bottom,
    Offset(i32),
}

impl Alignment {
    #[inline]
    pub const fn is_top(self) -> bool {
        matches!(self, Alignment::Top)
    }

    #[inline]
    pub const fn is_bottom(self) -> bool {
        matches!(self, Alignment::Bottom)
    }

    #[inline]
    pub const fn offset(self) -> Option<i32> {
        match self {
            Alignment::Offset(off) => Some(off),
            _ => None,
        }
    }

    /// Alignment of the element `bytes` further along; sentinels are kept.
    #[inline]
    pub const fn plus(self, bytes: i32) -> Alignment {
        match self {
            Alignment::Offset(off) => Alignment::Offset(off + bytes),
            other => other,
        }
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alignment::Top => write!(f, "top"),
            Alignment::Bottom => write!(f, "bottom"),
            Alignment::Offset(off) => write!(f, "{}", off),
        }
    }
}

// =============================================================================
// Node Info
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwNodeInfo {
    pub alignment: Alignment,
    /// Longest in-block dependence path from a phi.
    pub depth: u32,
    /// Element type the node would have as a vector lane.
    pub velt_type: Option<BasicType>,
    pub my_pack: Option<PackId>,
}

/// Dense table parallel to the block.
#[derive(Debug, Clone, Default)]
pub struct NodeInfoTable {
    infos: Vec<SwNodeInfo>,
}

impl NodeInfoTable {
    pub fn new(len: usize) -> Self {
        NodeInfoTable {
            infos: vec![SwNodeInfo::default(); len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> &SwNodeInfo {
        &self.infos[idx]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> &mut SwNodeInfo {
        &mut self.infos[idx]
    }

    /// Forget every pack back-reference.
    pub fn clear_packs(&mut self) {
        for info in &mut self.infos {
            info.my_pack = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SwNodeInfo> {
        self.infos.iter()
    }
}
