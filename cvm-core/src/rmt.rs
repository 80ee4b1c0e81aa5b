//! The module containing [`ReverseMappingTable`], described below.
//!
//! A sorted directory over all physical-RAM ranges the firmware reports.
//! Every leaf entry records the owning ASID, whether the frame is shared,
//! and its ownership class; the 128-bit layout mirrors `noir_rmt_entry`.

use crate::status::{NsvResult, NsvStatus};
use alloc::vec::Vec;
use spin::RwLock;

/// Ownership classes a host physical frame can carry (mirrors
/// `noir_nsv_rmt_*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Ownership {
    /// A frame belonging to the subverted host, not yet claimed by NoirVisor.
    SubvertedHost = 0,
    /// A frame reserved for the hypervisor's own use.
    Hypervisor = 1,
    /// A frame owned by an ordinary (non-secure) guest.
    InsecureGuest = 2,
    /// A frame owned by a secure guest.
    SecureGuest = 3,
}

bitfield::bitfield! {
    /// Low quadword of the 128-bit RMT leaf entry: `asid:32 | reserved:21 |
    /// shared:1 | ownership:8`.
    #[derive(Clone, Copy)]
    struct RmtEntryLow(u64);
    impl Debug;
    u32;
    asid, set_asid: 31, 0;
    u8;
    shared_raw, set_shared_raw: 55, 55;
    ownership_raw, set_ownership_raw: 63, 56;
}

bitfield::bitfield! {
    /// High quadword of the 128-bit RMT leaf entry: `reserved:12 |
    /// guest_pfn:52`.
    #[derive(Clone, Copy)]
    struct RmtEntryHigh(u64);
    impl Debug;
    u64;
    guest_pfn, set_guest_pfn: 63, 12;
}

/// One reverse-mapping-table entry for a single host-physical frame; the
/// 128-bit layout is carried over bit-for-bit from the source's "Candidate
/// 2" `noir_rmt_entry`.
#[derive(Clone, Copy, Debug)]
pub struct RmtEntry {
    low: RmtEntryLow,
    high: RmtEntryHigh,
}

impl RmtEntry {
    /// An entry describing a frame not yet assigned to anything.
    #[must_use]
    pub fn unowned() -> Self {
        let mut low = RmtEntryLow(0);
        low.set_ownership_raw(Ownership::SubvertedHost as u8);
        Self { low, high: RmtEntryHigh(0) }
    }

    /// The ASID currently owning the frame.
    #[must_use]
    pub fn asid(&self) -> u32 {
        self.low.asid()
    }

    /// True when the frame is shared between more than one owner.
    #[must_use]
    pub fn shared(&self) -> bool {
        self.low.shared_raw() != 0
    }

    /// The frame's current ownership class.
    #[must_use]
    pub fn ownership(&self) -> Ownership {
        match self.low.ownership_raw() {
            1 => Ownership::Hypervisor,
            2 => Ownership::InsecureGuest,
            3 => Ownership::SecureGuest,
            _ => Ownership::SubvertedHost,
        }
    }

    /// The guest-physical frame number this host frame is currently mapped
    /// to, if any.
    #[must_use]
    pub fn guest_pfn(&self) -> u64 {
        self.high.guest_pfn()
    }
}

/// One requested reassignment: reassign host-physical frame `hpa_pfn` to
/// `asid`, `shared`, `ownership`, mapped at `guest_pfn`.
#[derive(Clone, Copy, Debug)]
pub struct Reassignment {
    /// Host-physical frame number being reassigned.
    pub hpa_pfn: u64,
    /// New owning ASID.
    pub asid: u32,
    /// New shared flag.
    pub shared: bool,
    /// New ownership class.
    pub ownership: Ownership,
    /// New guest-physical frame number.
    pub guest_pfn: u64,
}

/// Sorted-by-HPA directory over every host-physical frame the firmware
/// reports. Binary search on host-physical frame number.
pub struct ReverseMappingTable {
    entries: RwLock<Vec<RmtEntry>>,
    base_pfn: u64,
}

impl ReverseMappingTable {
    /// Builds a table covering `frame_count` contiguous frames starting at
    /// `base_pfn`, all initially unowned. Mirrors
    /// `nvc_build_reverse_mapping_table`.
    #[must_use]
    pub fn new(base_pfn: u64, frame_count: usize) -> Self {
        let mut entries = Vec::with_capacity(frame_count);
        entries.resize(frame_count, RmtEntry::unowned());
        Self { entries: RwLock::new(entries), base_pfn }
    }

    fn slot(&self, hpa_pfn: u64) -> Option<usize> {
        hpa_pfn.checked_sub(self.base_pfn).map(|i| i as usize)
    }

    /// Reads the current entry for `hpa_pfn`, if it falls within the table.
    #[must_use]
    pub fn entry(&self, hpa_pfn: u64) -> Option<RmtEntry> {
        let index = self.slot(hpa_pfn)?;
        self.entries.read().get(index).copied()
    }

    /// Validates and applies `reassignments` as a single all-or-nothing
    /// batch, atomic with respect to other RMT mutators.
    ///
    /// Every target is checked against three rules before any change is
    /// written:
    /// 1. a frame currently owned by the hypervisor is never reassignable;
    /// 2. a secure-guest-owned frame is never marked shared;
    /// 3. ownership cannot transition to secure-guest in a multi-page call.
    ///
    /// # Errors
    /// Returns [`NsvStatus::NSV_VIOLATION`] if any target fails validation,
    /// or [`NsvStatus::INVALID_PARAMETER`] if any `hpa_pfn` is out of range.
    /// No partial update is made when either error occurs.
    pub fn configure_reverse_mapping(&self, reassignments: &[Reassignment]) -> NsvResult<()> {
        let secure_guest_targets =
            reassignments.iter().filter(|r| r.ownership == Ownership::SecureGuest).count();
        if secure_guest_targets > 1 {
            return Err(NsvStatus::NSV_VIOLATION);
        }

        let mut entries = self.entries.write();
        let mut indices = Vec::with_capacity(reassignments.len());
        for reassignment in reassignments {
            let index = self.slot(reassignment.hpa_pfn).ok_or(NsvStatus::INVALID_PARAMETER)?;
            let current = *entries.get(index).ok_or(NsvStatus::INVALID_PARAMETER)?;
            if current.ownership() == Ownership::Hypervisor {
                return Err(NsvStatus::NSV_VIOLATION);
            }
            if current.ownership() == Ownership::SecureGuest && reassignment.shared {
                return Err(NsvStatus::NSV_VIOLATION);
            }
            indices.push(index);
        }

        for (index, reassignment) in indices.into_iter().zip(reassignments.iter()) {
            let mut low = RmtEntryLow(0);
            low.set_asid(reassignment.asid);
            low.set_shared_raw(u8::from(reassignment.shared));
            low.set_ownership_raw(reassignment.ownership as u8);
            let mut high = RmtEntryHigh(0);
            high.set_guest_pfn(reassignment.guest_pfn);
            entries[index] = RmtEntry { low, high };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassign(hpa_pfn: u64, ownership: Ownership, shared: bool) -> Reassignment {
        Reassignment { hpa_pfn, asid: 7, shared, ownership, guest_pfn: hpa_pfn }
    }

    #[test]
    fn hypervisor_owned_frame_is_never_reassignable() {
        let rmt = ReverseMappingTable::new(0, 16);
        rmt.configure_reverse_mapping(&[reassign(3, Ownership::Hypervisor, false)]).unwrap();
        let err = rmt
            .configure_reverse_mapping(&[reassign(3, Ownership::InsecureGuest, false)])
            .unwrap_err();
        assert_eq!(err, NsvStatus::NSV_VIOLATION);
    }

    #[test]
    fn secure_guest_frame_is_never_shared() {
        let rmt = ReverseMappingTable::new(0, 16);
        rmt.configure_reverse_mapping(&[reassign(3, Ownership::SecureGuest, false)]).unwrap();
        let err =
            rmt.configure_reverse_mapping(&[reassign(3, Ownership::SecureGuest, true)]).unwrap_err();
        assert_eq!(err, NsvStatus::NSV_VIOLATION);
    }

    #[test]
    fn secure_guest_cannot_be_set_in_a_multi_page_batch() {
        let rmt = ReverseMappingTable::new(0, 16);
        let err = rmt
            .configure_reverse_mapping(&[
                reassign(1, Ownership::SecureGuest, false),
                reassign(2, Ownership::SecureGuest, false),
            ])
            .unwrap_err();
        assert_eq!(err, NsvStatus::NSV_VIOLATION);
    }

    #[test]
    fn batch_is_rejected_atomically_leaving_state_untouched() {
        let rmt = ReverseMappingTable::new(0, 16);
        rmt.configure_reverse_mapping(&[reassign(5, Ownership::Hypervisor, false)]).unwrap();
        let before = rmt.entry(1).unwrap().ownership();
        let err = rmt
            .configure_reverse_mapping(&[
                reassign(1, Ownership::InsecureGuest, false),
                reassign(5, Ownership::InsecureGuest, false),
            ])
            .unwrap_err();
        assert_eq!(err, NsvStatus::NSV_VIOLATION);
        assert_eq!(rmt.entry(1).unwrap().ownership(), before);
    }

    #[test]
    fn ordinary_reassignment_round_trips() {
        let rmt = ReverseMappingTable::new(100, 4);
        rmt.configure_reverse_mapping(&[reassign(101, Ownership::InsecureGuest, false)]).unwrap();
        let entry = rmt.entry(101).unwrap();
        assert_eq!(entry.ownership(), Ownership::InsecureGuest);
        assert_eq!(entry.asid(), 7);
        assert_eq!(entry.guest_pfn(), 101);
    }
}
