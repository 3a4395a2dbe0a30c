//! Cookie vector algebra.
//!
//! A `CsnVector` is an ordered set of `(sid, csn)` slots, kept sorted by sid
//! ascending. A sid of `-1` is a hole and is skipped by every operation.
//! These vectors are the multi-provider context state: one change stamp per
//! server in the cluster.

use crate::csn::Csn;
use crate::types::Sid;
use std::fmt;

/// One slot of a cookie vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub sid: Sid,
    pub csn: Csn,
}

/// Outcome of comparing two vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Less,
    Equal,
    Greater,
}

impl VectorOrdering {
    pub fn flip(self) -> Self {
        match self {
            VectorOrdering::Less => VectorOrdering::Greater,
            VectorOrdering::Greater => VectorOrdering::Less,
            VectorOrdering::Equal => VectorOrdering::Equal,
        }
    }
}

/// Outcome of an age check against a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeCheck {
    /// Stamp is newer than the slot for its sid.
    Ok { slot: usize },
    /// Stamp is not newer than what the vector already holds.
    TooOld,
    /// No slot for this sid yet; `slot` is the insertion position.
    NewSid { slot: usize },
}

/// Sorted vector of `(sid, csn)` slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsnVector {
    slots: Vec<Slot>,
}

impl CsnVector {
    pub fn new() -> Self {
        CsnVector { slots: Vec::new() }
    }

    /// Build from unordered pairs; sorts by sid.
    pub fn from_pairs(pairs: Vec<(Sid, Csn)>) -> Self {
        let mut slots: Vec<Slot> = pairs
            .into_iter()
            .map(|(sid, csn)| Slot { sid, csn })
            .collect();
        slots.sort_by_key(|s| s.sid);
        CsnVector { slots }
    }

    /// Build from raw stamps, extracting each sid from the stamp itself.
    /// Stamps whose sid cannot be parsed are kept as holes.
    pub fn from_stamps(stamps: Vec<Csn>) -> Self {
        let pairs = stamps
            .into_iter()
            .map(|csn| (csn.sid().unwrap_or(Sid::HOLE), csn))
            .collect();
        Self::from_pairs(pairs)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn slot_for_sid(&self, sid: Sid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.sid.is_hole() && s.sid == sid)
    }

    pub fn get(&self, sid: Sid) -> Option<&Csn> {
        self.slot_for_sid(sid).map(|i| &self.slots[i].csn)
    }

    /// Overwrite the stamp at an existing slot.
    pub fn set_slot(&mut self, slot: usize, csn: Csn) {
        self.slots[slot].csn = csn;
    }

    pub fn slot(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot)
    }

    /// Insert a new `(sid, csn)` at the given position, keeping sid order.
    pub fn insert_at(&mut self, slot: usize, sid: Sid, csn: Csn) {
        let at = slot.min(self.slots.len());
        self.slots.insert(at, Slot { sid, csn });
    }

    /// The highest stamp across all non-hole slots.
    pub fn max_csn(&self) -> Option<&Csn> {
        self.slots
            .iter()
            .filter(|s| !s.sid.is_hole() && !s.csn.is_empty())
            .map(|s| &s.csn)
            .max()
    }

    /// Compare against `other`, reporting which side is behind and the first
    /// witnessing position in `other`.
    ///
    /// `Less` means at least one of `other`'s slots is ahead of (or missing
    /// from) `self`.
    pub fn compare(&self, other: &CsnVector) -> (VectorOrdering, usize) {
        if self.len() < other.len() {
            // Find the first position where the sids diverge.
            let mut i = 0;
            while i < self.len() && self.slots[i].sid == other.slots[i].sid {
                i += 1;
            }
            return (VectorOrdering::Less, i);
        }

        let mut ord = VectorOrdering::Equal;
        for (j, os) in other.slots.iter().enumerate() {
            if os.sid.is_hole() {
                continue;
            }
            match self.slot_for_sid(os.sid) {
                None => return (VectorOrdering::Less, j),
                Some(i) => match self.slots[i].csn.cmp(&os.csn) {
                    std::cmp::Ordering::Less => return (VectorOrdering::Less, j),
                    std::cmp::Ordering::Greater => ord = VectorOrdering::Greater,
                    std::cmp::Ordering::Equal => {}
                },
            }
        }
        (ord, 0)
    }

    /// Merge `src` into `self`, taking the per-sid maximum and adopting sids
    /// `self` lacks. Returns the highest stamp that moved, or `None` when
    /// nothing changed.
    pub fn merge_from(&mut self, src: &CsnVector) -> Option<Csn> {
        fn track(moved: &mut Option<Csn>, csn: &Csn) {
            match moved {
                Some(m) if &*m >= csn => {}
                _ => *moved = Some(csn.clone()),
            }
        }
        let mut moved: Option<Csn> = None;

        // Fast path: identical sid layout, adopt element-wise maxima.
        if self.len() == src.len()
            && self
                .slots
                .iter()
                .zip(&src.slots)
                .all(|(a, b)| a.sid == b.sid)
        {
            for (dst, s) in self.slots.iter_mut().zip(&src.slots) {
                if dst.sid.is_hole() {
                    continue;
                }
                if dst.csn < s.csn {
                    dst.csn = s.csn.clone();
                    track(&mut moved, &dst.csn);
                }
            }
            return moved;
        }

        // Slow path: ordered union over sids, skipping holes.
        let mut out: Vec<Slot> = Vec::with_capacity(self.len() + src.len());
        let (mut i, mut j) = (0, 0);
        while i < self.len() || j < src.len() {
            if i < self.len() && self.slots[i].sid.is_hole() {
                i += 1;
                continue;
            }
            if j < src.len() && src.slots[j].sid.is_hole() {
                j += 1;
                continue;
            }
            if j >= src.len() || (i < self.len() && self.slots[i].sid < src.slots[j].sid) {
                out.push(self.slots[i].clone());
                i += 1;
            } else if i < self.len() && self.slots[i].sid == src.slots[j].sid {
                let mut slot = self.slots[i].clone();
                if slot.csn < src.slots[j].csn {
                    slot.csn = src.slots[j].csn.clone();
                    track(&mut moved, &slot.csn);
                }
                out.push(slot);
                i += 1;
                j += 1;
            } else {
                track(&mut moved, &src.slots[j].csn);
                out.push(src.slots[j].clone());
                j += 1;
            }
        }
        self.slots = out;
        moved
    }

    /// Merge returning only whether anything moved.
    pub fn merge(&mut self, src: &CsnVector) -> bool {
        self.merge_from(src).is_some()
    }

    /// Check a stamp's age against this vector.
    ///
    /// Scans sids ascending, stopping at the first slot with `sid' >= sid`.
    /// A slot whose stamp is empty carries no information and never reports
    /// `TooOld`.
    pub fn check_age(&self, sid: Sid, csn: &Csn) -> AgeCheck {
        let mut i = 0;
        while i < self.slots.len() {
            let s = &self.slots[i];
            if !s.sid.is_hole() {
                if sid < s.sid {
                    break;
                }
                if s.sid == sid {
                    if !s.csn.is_empty() && csn <= &s.csn {
                        return AgeCheck::TooOld;
                    }
                    return AgeCheck::Ok { slot: i };
                }
            }
            i += 1;
        }
        AgeCheck::NewSid { slot: i }
    }
}

impl fmt::Display for CsnVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for s in &self.slots {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            write!(f, "{}", s.csn)?;
        }
        Ok(())
    }
}
