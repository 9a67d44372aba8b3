use crate::segment::{Placement, Segment, SegmentError};
use crate::Access;
use std::rc::{Rc, Weak};

/// Small integer naming a segment within a [`SegmentTable`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SegmentId(pub u16);

impl core::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How much address space to reserve per segment.
///
/// Segments never move, so the reservation caps how far a guest heap can
/// grow. Writable segments get the larger budget.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ReservationPolicy {
    pub default: usize,
    pub writable: usize,
}

impl ReservationPolicy {
    pub const DEFAULT_RESERVATION: usize = 16 * 1024 * 1024;
    pub const WRITABLE_RESERVATION: usize = 256 * 1024 * 1024;

    #[must_use]
    pub const fn for_access(&self, access: Access) -> usize {
        if access.is_writable() {
            self.writable
        } else {
            self.default
        }
    }
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            default: Self::DEFAULT_RESERVATION,
            writable: Self::WRITABLE_RESERVATION,
        }
    }
}

/// Arena of segments indexed by [`SegmentId`].
///
/// The table only holds weak references: a segment lives exactly as long as
/// something (usually a descriptor) holds its `Rc`, and its id becomes
/// available again afterwards.
#[derive(Debug)]
pub struct SegmentTable {
    slots: Vec<Weak<Segment>>,
    policy: ReservationPolicy,
    placement: Placement,
}

impl SegmentTable {
    #[must_use]
    pub const fn new(policy: ReservationPolicy, placement: Placement) -> Self {
        Self {
            slots: Vec::new(),
            policy,
            placement,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ReservationPolicy {
        self.policy
    }

    #[must_use]
    pub const fn placement(&self) -> Placement {
        self.placement
    }

    /// Allocate a segment, reserving according to the policy.
    pub fn allocate(&mut self, access: Access, size: usize) -> Result<Rc<Segment>, SegmentError> {
        let reservation = self.policy.for_access(access);
        self.allocate_reserved(access, size, reservation)
    }

    /// Allocate a segment with an explicit reservation.
    pub fn allocate_reserved(
        &mut self,
        access: Access,
        size: usize,
        reservation: usize,
    ) -> Result<Rc<Segment>, SegmentError> {
        let slot = self.free_slot();
        let id = SegmentId(u16::try_from(slot).map_err(|_| SegmentError::ReservationExceeded {
            requested: size,
            reserved: 0,
        })?);
        let segment = Rc::new(Segment::allocate(
            id,
            access,
            size,
            reservation,
            self.placement,
        )?);
        if slot == self.slots.len() {
            self.slots.push(Rc::downgrade(&segment));
        } else {
            self.slots[slot] = Rc::downgrade(&segment);
        }
        Ok(segment)
    }

    /// Look up a live segment.
    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<Rc<Segment>> {
        self.slots.get(usize::from(id.0)).and_then(Weak::upgrade)
    }

    /// Number of live segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|w| w.strong_count() > 0).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live segments in id order.
    pub fn iter(&self) -> impl Iterator<Item = Rc<Segment>> + '_ {
        self.slots.iter().filter_map(Weak::upgrade)
    }

    fn free_slot(&self) -> usize {
        self.slots
            .iter()
            .position(|w| w.strong_count() == 0)
            .unwrap_or(self.slots.len())
    }
}
