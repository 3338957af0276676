use crate::*;
use anyhow::{anyhow, Result};
use memtable::{Memtable, ValueEntry};
use std::path::Path;
use tempfile::tempdir;

fn write_segment(dir: &Path, generation: u64, entries: &[(&str, ValueEntry)]) -> Result<Segment> {
    let owned: Vec<(Vec<u8>, ValueEntry)> = entries
        .iter()
        .map(|(k, e)| (k.as_bytes().to_vec(), e.clone()))
        .collect();
    SegmentWriter::build(dir, generation, 2, owned)
}

fn put(seq: u64, v: &[u8]) -> ValueEntry {
    ValueEntry::put(seq, v.to_vec())
}

// -------------------- Basic merge --------------------

#[test]
fn merge_single_segment() -> Result<()> {
    let dir = tempdir()?;
    let seg = write_segment(dir.path(), 1, &[("a", put(1, b"1")), ("b", put(2, b"2"))])?;

    let merged = MergeIterator::over_segments([&seg])?.collect_all()?;
    assert_eq!(
        merged,
        vec![(b"a".to_vec(), put(1, b"1")), (b"b".to_vec(), put(2, b"2"))]
    );
    Ok(())
}

#[test]
fn merge_no_sources() -> Result<()> {
    let merged = MergeIterator::new(Vec::new())?.collect_all()?;
    assert!(merged.is_empty());
    Ok(())
}

#[test]
fn merge_two_non_overlapping() -> Result<()> {
    let dir = tempdir()?;
    let s1 = write_segment(dir.path(), 1, &[("a", put(1, b"1")), ("c", put(2, b"3"))])?;
    let s2 = write_segment(dir.path(), 2, &[("b", put(3, b"2")), ("d", put(4, b"4"))])?;

    let keys: Vec<Vec<u8>> = MergeIterator::over_segments([&s1, &s2])?
        .collect_all()?
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    Ok(())
}

// -------------------- Dedup by seq --------------------

#[test]
fn overlapping_keys_highest_seq_wins() -> Result<()> {
    let dir = tempdir()?;
    let older = write_segment(dir.path(), 1, &[("k", put(1, b"old")), ("x", put(2, b"x1"))])?;
    let newer = write_segment(dir.path(), 2, &[("k", put(5, b"new"))])?;

    // Source order does not matter, only seq.
    for order in [[&older, &newer], [&newer, &older]] {
        let merged = MergeIterator::over_segments(order)?.collect_all()?;
        assert_eq!(
            merged,
            vec![(b"k".to_vec(), put(5, b"new")), (b"x".to_vec(), put(2, b"x1"))]
        );
    }
    Ok(())
}

#[test]
fn tombstone_wins_over_older_value() -> Result<()> {
    let dir = tempdir()?;
    let older = write_segment(dir.path(), 1, &[("k", put(1, b"v"))])?;
    let newer = write_segment(dir.path(), 2, &[("k", ValueEntry::tombstone(2))])?;

    let merged = MergeIterator::over_segments([&older, &newer])?.collect_all()?;
    assert_eq!(merged, vec![(b"k".to_vec(), ValueEntry::tombstone(2))]);
    Ok(())
}

#[test]
fn three_way_overlap_emits_one_entry_per_key() -> Result<()> {
    let dir = tempdir()?;
    let s1 = write_segment(dir.path(), 1, &[("a", put(1, b"a1")), ("b", put(2, b"b1"))])?;
    let s2 = write_segment(dir.path(), 2, &[("b", put(3, b"b2")), ("c", put(4, b"c2"))])?;
    let s3 = write_segment(dir.path(), 3, &[("a", put(5, b"a3")), ("c", put(6, b"c3"))])?;

    let merged = MergeIterator::over_segments([&s1, &s2, &s3])?.collect_all()?;
    assert_eq!(
        merged,
        vec![
            (b"a".to_vec(), put(5, b"a3")),
            (b"b".to_vec(), put(3, b"b2")),
            (b"c".to_vec(), put(6, b"c3")),
        ]
    );
    Ok(())
}

#[test]
fn merge_many_keys_output_sorted_and_unique() -> Result<()> {
    let dir = tempdir()?;
    let mut segments = Vec::new();
    for g in 0..4u64 {
        let entries: Vec<(Vec<u8>, ValueEntry)> = (0..200u64)
            .filter(|i| i % (g + 1) == 0)
            .map(|i| (format!("k{i:04}").into_bytes(), put(g * 1000 + i + 1, b"v")))
            .collect();
        segments.push(SegmentWriter::build(dir.path(), g + 1, 8, entries)?);
    }

    let merged = MergeIterator::over_segments(segments.iter())?.collect_all()?;
    assert_eq!(merged.len(), 200);
    assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));
    // k0000 is in all four; the last segment has the highest seq.
    assert_eq!(merged[0].1.seq, 3001);
    Ok(())
}

// -------------------- Mixed sources --------------------

#[test]
fn memtable_and_segment_sources_merge() -> Result<()> {
    let dir = tempdir()?;
    let seg = write_segment(dir.path(), 1, &[("a", put(1, b"disk")), ("b", put(2, b"disk"))])?;
    let mem = Memtable::new();
    mem.put(b"b".to_vec(), b"mem".to_vec(), 3)?;
    mem.delete(b"a".to_vec(), 4)?;

    let sources: Vec<EntrySource<'_>> = vec![
        Box::new(mem.iter().map(Ok::<_, anyhow::Error>)),
        Box::new(seg.iter()),
    ];
    let merged = MergeIterator::new(sources)?.collect_all()?;
    assert_eq!(
        merged,
        vec![
            (b"a".to_vec(), ValueEntry::tombstone(4)),
            (b"b".to_vec(), put(3, b"mem")),
        ]
    );
    Ok(())
}

#[test]
fn source_error_is_surfaced_once() -> Result<()> {
    let failing: EntrySource<'_> = Box::new(
        vec![
            Ok((b"a".to_vec(), put(1, b"1"))),
            Err(anyhow!("disk on fire")),
            Ok((b"z".to_vec(), put(2, b"2"))),
        ]
        .into_iter(),
    );
    let mut merge = MergeIterator::new(vec![failing])?;
    // Pulling "a" advances the source into the error.
    assert!(merge.next().unwrap().is_err());
    assert!(merge.next().is_none());
    Ok(())
}
