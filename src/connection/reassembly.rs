use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::RconError;

/// What storing one fragment did to its group.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReassemblyOutcome {
    /// stored, group still waiting for more fragments
    Stored,
    /// every slot is filled; the concatenated payload, fragments in index order
    Complete(String),
    /// the final-index fragment arrived but earlier slots are still empty - the sender
    ///  probably dropped them, time to consider a retransmission
    MissingFragments,
}

struct FragmentGroup {
    parts: Vec<Option<Bytes>>,
}

/// Multipart command replies under reassembly, one group per sequence number.
pub struct ReassemblyTable {
    groups: FxHashMap<u8, FragmentGroup>,
}

impl ReassemblyTable {
    pub fn new() -> ReassemblyTable {
        ReassemblyTable {
            groups: Default::default(),
        }
    }

    /// Stores one fragment. The first fragment of a sequence fixes the group's size; fragments
    ///  disagreeing with it (or indexing past it) are rejected as [RconError::InvalidSequence].
    ///
    /// Completion is checked on every insert, so fragments may arrive in any order. A
    ///  completed group is removed before this returns.
    pub fn insert(&mut self, sequence: u8, total: u8, index: u8, part: Bytes) -> Result<ReassemblyOutcome, RconError> {
        if index >= total {
            return Err(RconError::InvalidSequence(index));
        }

        let group = self.groups.entry(sequence)
            .or_insert_with(|| FragmentGroup { parts: vec![None; total as usize] });
        if group.parts.len() != total as usize {
            return Err(RconError::InvalidSequence(sequence));
        }

        trace!(sequence, total, index, len = part.len(), "storing fragment");
        group.parts[index as usize] = Some(part);

        if group.parts.iter().all(Option::is_some) {
            let group = self.groups.remove(&sequence).expect("group was just inserted");
            let mut assembled = Vec::new();
            for part in group.parts.into_iter().flatten() {
                assembled.extend_from_slice(&part);
            }
            return Ok(ReassemblyOutcome::Complete(String::from_utf8_lossy(&assembled).into_owned()));
        }

        if index + 1 == total {
            return Ok(ReassemblyOutcome::MissingFragments);
        }
        Ok(ReassemblyOutcome::Stored)
    }

    pub fn remove(&mut self, sequence: u8) {
        self.groups.remove(&sequence);
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::in_order(&[0, 1, 2])]
    #[case::reverse(&[2, 1, 0])]
    #[case::final_first(&[2, 0, 1])]
    fn test_fragments_complete_in_any_order(#[case] order: &[u8]) {
        let parts: [&[u8]; 3] = [b"he", b"llo ", b"world"];
        let mut table = ReassemblyTable::new();

        let mut outcomes = Vec::new();
        for &index in order {
            let outcome = table
                .insert(3, 3, index, Bytes::copy_from_slice(parts[index as usize]))
                .unwrap();
            outcomes.push(outcome);
        }

        assert_eq!(outcomes.last().unwrap(), &ReassemblyOutcome::Complete("hello world".to_string()));
        // completion cleared the group, a fresh fragment starts over
        assert_eq!(table.insert(3, 2, 0, Bytes::from_static(b"x")).unwrap(), ReassemblyOutcome::Stored);
    }

    #[test]
    fn test_final_fragment_with_gap_reports_missing() {
        let mut table = ReassemblyTable::new();
        let outcome = table.insert(5, 2, 1, Bytes::from_static(b"world")).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::MissingFragments);

        // the late fragment still completes the group
        let outcome = table.insert(5, 2, 0, Bytes::from_static(b"hello ")).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::Complete("hello world".to_string()));
    }

    #[test]
    fn test_middle_fragment_is_just_stored() {
        let mut table = ReassemblyTable::new();
        assert_eq!(table.insert(0, 3, 0, Bytes::from_static(b"a")).unwrap(), ReassemblyOutcome::Stored);
        assert_eq!(table.insert(0, 3, 1, Bytes::from_static(b"b")).unwrap(), ReassemblyOutcome::Stored);
    }

    #[rstest]
    #[case::index_beyond_total(2, 2)]
    #[case::zero_total(0, 0)]
    fn test_index_out_of_range(#[case] total: u8, #[case] index: u8) {
        let mut table = ReassemblyTable::new();
        assert_eq!(
            table.insert(1, total, index, Bytes::from_static(b"x")),
            Err(RconError::InvalidSequence(index))
        );
    }

    #[test]
    fn test_total_mismatch_within_group() {
        let mut table = ReassemblyTable::new();
        table.insert(1, 3, 0, Bytes::from_static(b"x")).unwrap();
        assert_eq!(
            table.insert(1, 4, 1, Bytes::from_static(b"y")),
            Err(RconError::InvalidSequence(1))
        );
    }

    #[test]
    fn test_duplicate_fragment_overwrites() {
        let mut table = ReassemblyTable::new();
        table.insert(9, 2, 0, Bytes::from_static(b"old ")).unwrap();
        table.insert(9, 2, 0, Bytes::from_static(b"new ")).unwrap();
        let outcome = table.insert(9, 2, 1, Bytes::from_static(b"data")).unwrap();
        assert_eq!(outcome, ReassemblyOutcome::Complete("new data".to_string()));
    }
}
