use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;
use rayon::prelude::*;
use statrs::statistics::Statistics;

use crate::align::params::{AlignmentParams, BlankFiltering};
use crate::align::utility::{pearson_correlation, within_tolerance, Dsu};
use crate::data::file::FileType;
use crate::data::peak::{LinkedPeakFeature, PeakLinkCharacter};
use crate::data::spot::{AlignmentSpot, AnnotationCategory, SpotVariableCorrelation};

/// Minimum Pearson correlation of two spots' sample-height vectors for a
/// `CorrelSimilar` link.
pub const HIGH_CORRELATION: f64 = 0.95;

/// Correlation candidates are limited to spots whose time centers lie within
/// this many retention-time tolerances of each other. The pair predicate is
/// window-independent, so the bound only caps the amount of work.
pub const CORRELATION_RT_WINDOW_FACTOR: f64 = 5.0;

/// Post-processing pipeline that turns the joiner's raw spot list into the
/// delivered alignment table.
///
/// Stages run in a fixed order because each depends on the side effects of
/// the previous one: annotation dedup, blank filtering, spot compression,
/// correlation linking, link registration, peak grouping, feature removal,
/// renumbering.
#[derive(Clone, Debug)]
pub struct AlignmentRefiner {
    params: AlignmentParams,
}

impl AlignmentRefiner {
    pub fn new(params: AlignmentParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AlignmentParams {
        &self.params
    }

    pub fn refine(&self, mut spots: Vec<AlignmentSpot>) -> Vec<AlignmentSpot> {
        deduplicate_annotations(&mut spots, &self.params);
        flag_blank_features(&mut spots, &self.params);
        let merged = compress_spots(&mut spots, &self.params);
        let linked = link_by_correlation(&mut spots, &self.params);
        register_links(&mut spots);
        assign_peak_groups(&mut spots);
        let removed = remove_features(&mut spots, &self.params);
        renumber(&mut spots);
        debug!(
            "refined alignment table: {} merged, {} correlation links, {} removed, {} spots out",
            merged,
            linked,
            removed,
            spots.len()
        );
        spots
    }
}

/// Heights of the filled slots keyed by file id.
fn height_by_file(spot: &AlignmentSpot) -> BTreeMap<usize, f64> {
    spot.aligned_peaks
        .iter()
        .flatten()
        .map(|p| (p.file_id, p.height))
        .collect()
}

/// Dense height vector over the given file ids; missing slots read as 0.0.
fn height_vector(spot: &AlignmentSpot, file_ids: &[usize]) -> Vec<f64> {
    let by_file = height_by_file(spot);
    file_ids
        .iter()
        .map(|id| by_file.get(id).copied().unwrap_or(0.0))
        .collect()
}

// ---------------------------------------------------------------------------
// Stage 1: annotation deduplication
// ---------------------------------------------------------------------------

/// When a "top hit only" flag is set, every reference may annotate at most
/// one spot: the group member with the highest score keeps its results, ties
/// go to the first-encountered spot, all others are blanked.
fn deduplicate_annotations(spots: &mut [AlignmentSpot], params: &AlignmentParams) {
    if params.only_report_top_hit_in_msp_search {
        let groups = spots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.top_msp_reference().map(|r| (r, idx)))
            .into_group_map();
        for (_, members) in groups.into_iter().sorted_by_key(|(r, _)| *r) {
            let mut winner = members[0];
            let mut best = f32::MIN;
            for &idx in &members {
                let score = spots[idx].best_msp_match().map_or(f32::MIN, |m| m.score);
                if score > best {
                    best = score;
                    winner = idx;
                }
            }
            for &idx in &members {
                if idx != winner {
                    spots[idx].msp_matches.clear();
                    spots[idx].name.clear();
                }
            }
        }
    }

    if params.only_report_top_hit_in_text_db_search {
        let groups = spots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.text_db_reference().map(|r| (r, idx)))
            .into_group_map();
        for (_, members) in groups.into_iter().sorted_by_key(|(r, _)| *r) {
            let mut winner = members[0];
            let mut best = f32::MIN;
            for &idx in &members {
                let score = spots[idx].text_db_match.as_ref().map_or(f32::MIN, |m| m.score);
                if score > best {
                    best = score;
                    winner = idx;
                }
            }
            for &idx in &members {
                if idx != winner {
                    spots[idx].text_db_match = None;
                    spots[idx].name.clear();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 2: blank filtering
// ---------------------------------------------------------------------------

/// Flags spots whose sample intensity is not meaningfully above the blank
/// intensity. Only sets `is_blank_filtered`; removal happens in stage 7.
/// With no blank files the blank statistic is 0.0 and nothing is flagged
/// (for a positive fold change).
fn flag_blank_features(spots: &mut [AlignmentSpot], params: &AlignmentParams) {
    let sample_ids = params.file_ids_of_type(FileType::Sample);
    let blank_ids = params.file_ids_of_type(FileType::Blank);
    let fold = params.fold_change_for_blank_filtering;

    let mut flagged = 0usize;
    for spot in spots.iter_mut() {
        let samples = height_vector(spot, &sample_ids);
        let blanks = height_vector(spot, &blank_ids);

        let sample_stat = if samples.is_empty() {
            0.0
        } else {
            match params.blank_filtering {
                BlankFiltering::SampleMaxOverBlankAve => Statistics::max(samples.iter()),
                BlankFiltering::SampleAveOverBlankAve => Statistics::mean(samples.iter()),
            }
        };
        let blank_stat = if blanks.is_empty() { 0.0 } else { Statistics::mean(blanks.iter()) };

        // strict: equality with the threshold is not filtered
        spot.filter_status.is_blank_filtered = sample_stat < blank_stat * fold;
        flagged += spot.filter_status.is_blank_filtered as usize;
    }
    debug!("blank filter flagged {} of {} spots", flagged, spots.len());
}

// ---------------------------------------------------------------------------
// Stage 3: spot compression
// ---------------------------------------------------------------------------

/// Collapses near-duplicate spots: when two spots lie strictly inside both
/// tolerances, the later one in current order is discarded. A surviving spot
/// keeps absorbing later duplicates, so the result is a fixpoint and a
/// second refinement pass merges nothing.
fn compress_spots(spots: &mut Vec<AlignmentSpot>, params: &AlignmentParams) -> usize {
    let n = spots.len();
    let mut dropped = vec![false; n];
    // joiner output is mass-sorted, which allows an early break; fall back
    // to the full scan when the caller hands over an unsorted list
    let mass_sorted = spots.windows(2).all(|w| w[0].mz <= w[1].mz);

    for i in 0..n {
        if dropped[i] {
            continue;
        }
        for j in i + 1..n {
            if dropped[j] {
                continue;
            }
            if mass_sorted && spots[j].mz - spots[i].mz >= params.ms1_tolerance {
                break;
            }
            if within_tolerance(spots[i].mz, spots[j].mz, params.ms1_tolerance)
                && within_tolerance(spots[i].rt, spots[j].rt, params.retention_time_tolerance)
            {
                dropped[j] = true;
            }
        }
    }

    let mut idx = 0usize;
    spots.retain(|_| {
        let keep = !dropped[idx];
        idx += 1;
        keep
    });
    n - spots.len()
}

// ---------------------------------------------------------------------------
// Stage 4: correlation linking
// ---------------------------------------------------------------------------

/// True when the two spots are marked as isotopes of one another, either on
/// the spot level (from an earlier refinement) or on the per-run peak level
/// assigned during upstream characterization.
fn are_isotope_partners(a: &AlignmentSpot, b: &AlignmentSpot) -> bool {
    if a.is_isotope_pair_with(b.master_alignment_id) || b.is_isotope_pair_with(a.master_alignment_id)
    {
        return true;
    }
    for (sa, sb) in a.aligned_peaks.iter().zip(b.aligned_peaks.iter()) {
        if let (Some(pa), Some(pb)) = (sa, sb) {
            let forward = pa.character.peak_links.iter().any(|l| {
                l.character == PeakLinkCharacter::Isotope && l.linked_peak_id == pb.peak_id
            });
            let reverse = pb.character.peak_links.iter().any(|l| {
                l.character == PeakLinkCharacter::Isotope && l.linked_peak_id == pa.peak_id
            });
            if forward || reverse {
                return true;
            }
        }
    }
    false
}

fn push_correlation(spot: &mut AlignmentSpot, partner: usize, correlation: f64) {
    if spot.correlations.iter().any(|c| c.partner_alignment_id == partner) {
        return;
    }
    spot.correlations.push(SpotVariableCorrelation { partner_alignment_id: partner, correlation });
}

/// Links spot pairs whose sample-height profiles co-vary almost perfectly.
/// Scores are computed in parallel over the candidate pairs and applied in
/// pair order, so the output is independent of the thread schedule.
fn link_by_correlation(spots: &mut [AlignmentSpot], params: &AlignmentParams) -> usize {
    let sample_ids = params.file_ids_of_type(FileType::Sample);
    if sample_ids.len() < 2 || spots.len() < 2 {
        return 0;
    }
    let window = CORRELATION_RT_WINDOW_FACTOR * params.retention_time_tolerance;
    let vectors: Vec<Vec<f64>> = spots.iter().map(|s| height_vector(s, &sample_ids)).collect();

    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for i in 0..spots.len() {
        for j in i + 1..spots.len() {
            if (spots[i].rt - spots[j].rt).abs() > window {
                continue;
            }
            if are_isotope_partners(&spots[i], &spots[j]) {
                continue;
            }
            pairs.push((i, j));
        }
    }

    let scores: Vec<f64> = pairs
        .par_iter()
        .map(|&(i, j)| pearson_correlation(&vectors[i], &vectors[j]))
        .collect();

    let mut linked = 0usize;
    for (&(i, j), &r) in pairs.iter().zip(scores.iter()) {
        if r < HIGH_CORRELATION {
            continue;
        }
        let id_i = spots[i].master_alignment_id;
        let id_j = spots[j].master_alignment_id;
        spots[i].add_link(LinkedPeakFeature {
            linked_peak_id: id_j,
            character: PeakLinkCharacter::CorrelSimilar,
        });
        spots[j].add_link(LinkedPeakFeature {
            linked_peak_id: id_i,
            character: PeakLinkCharacter::CorrelSimilar,
        });
        push_correlation(&mut spots[i], id_j, r);
        push_correlation(&mut spots[j], id_i, r);
        linked += 1;
    }
    for spot in spots.iter_mut() {
        spot.correlations.sort_by_key(|c| c.partner_alignment_id);
    }
    linked
}

// ---------------------------------------------------------------------------
// Stage 5: link registration
// ---------------------------------------------------------------------------

/// Slot index of the representative peak: annotated beats unannotated,
/// MS2-confirmed beats suggested, then highest peak wins; ties go to the
/// earlier file.
fn representative_slot(spot: &AlignmentSpot) -> Option<usize> {
    let mut best: Option<(usize, u8, u8, f64)> = None;
    for (idx, slot) in spot.aligned_peaks.iter().enumerate() {
        let Some(slot) = slot else { continue };
        let msp_annotated = slot.msp_match.as_ref().map_or(false, |m| m.is_annotated());
        let ms2 = slot
            .msp_match
            .as_ref()
            .map_or(false, |m| m.is_annotated() && m.is_ms2_match);
        let annotated = msp_annotated
            || slot.text_db_match.as_ref().map_or(false, |m| m.is_annotated());
        let key = (ms2 as u8, annotated as u8, slot.height);
        let better = match best {
            None => true,
            Some((_, b_ms2, b_ann, b_h)) => {
                (key.0, key.1) > (b_ms2, b_ann) || ((key.0, key.1) == (b_ms2, b_ann) && key.2 > b_h)
            }
        };
        if better {
            best = Some((idx, key.0, key.1, key.2));
        }
    }
    best.map(|(idx, _, _, _)| idx)
}

/// Copies the representative peak's characterization links onto the spot,
/// translated from per-file peak ids into spot ids, and makes every grouping
/// link bidirectional.
fn register_links(spots: &mut [AlignmentSpot]) {
    let mut peak_to_spot: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for (idx, spot) in spots.iter().enumerate() {
        for slot in spot.aligned_peaks.iter().flatten() {
            peak_to_spot.insert((slot.file_id, slot.peak_id), idx);
        }
    }

    for idx in 0..spots.len() {
        let Some(rep) = representative_slot(&spots[idx]) else { continue };
        let Some(slot) = spots[idx].aligned_peaks[rep].as_ref() else { continue };
        let (rep_file, rep_character) = (slot.file_id, slot.character.clone());
        spots[idx].representative_file_id = rep_file;
        spots[idx].character.isotope_weight_number = rep_character.isotope_weight_number;
        spots[idx].character.charge = rep_character.charge;
        spots[idx].character.adduct = rep_character.adduct.clone();

        if spots[idx].name.is_empty() {
            if let Some(m) = spots[idx].best_msp_match().filter(|m| m.is_annotated()) {
                spots[idx].name = m.name.clone();
            } else if let Some(m) = spots[idx].text_db_match.as_ref().filter(|m| m.is_annotated()) {
                spots[idx].name = m.name.clone();
            }
        }

        for link in &rep_character.peak_links {
            if !link.character.is_grouping() {
                continue;
            }
            if let Some(&partner) = peak_to_spot.get(&(rep_file, link.linked_peak_id)) {
                if partner != idx {
                    let partner_id = spots[partner].master_alignment_id;
                    spots[idx].add_link(LinkedPeakFeature {
                        linked_peak_id: partner_id,
                        character: link.character,
                    });
                }
            }
        }
    }

    // force every grouping link bidirectional
    let master_to_idx: BTreeMap<usize, usize> = spots
        .iter()
        .enumerate()
        .map(|(idx, s)| (s.master_alignment_id, idx))
        .collect();
    let mut pending: Vec<(usize, LinkedPeakFeature)> = Vec::new();
    for spot in spots.iter() {
        for link in &spot.character.peak_links {
            if !link.character.is_grouping() {
                continue;
            }
            if let Some(&partner) = master_to_idx.get(&link.linked_peak_id) {
                pending.push((
                    partner,
                    LinkedPeakFeature {
                        linked_peak_id: spot.master_alignment_id,
                        character: link.character,
                    },
                ));
            }
        }
    }
    for (partner, link) in pending {
        spots[partner].add_link(link);
    }
}

// ---------------------------------------------------------------------------
// Stage 6: peak grouping
// ---------------------------------------------------------------------------

/// Connected components over the grouping link graph; `peak_group_id` = the
/// component index in order of first encounter in the current spot order.
fn assign_peak_groups(spots: &mut [AlignmentSpot]) {
    let master_to_idx: BTreeMap<usize, usize> = spots
        .iter()
        .enumerate()
        .map(|(idx, s)| (s.master_alignment_id, idx))
        .collect();

    let mut dsu = Dsu::new(spots.len());
    for (idx, spot) in spots.iter().enumerate() {
        for link in &spot.character.peak_links {
            if !link.character.is_grouping() {
                continue;
            }
            if let Some(&partner) = master_to_idx.get(&link.linked_peak_id) {
                dsu.union(idx, partner);
            }
        }
    }
    for (spot, group_id) in spots.iter_mut().zip(dsu.component_ids()) {
        spot.character.peak_group_id = group_id;
    }
}

// ---------------------------------------------------------------------------
// Stage 7: feature removal
// ---------------------------------------------------------------------------

/// Deletes (not flags) spots according to the keep flags: the blank term and
/// the annotation-category term are independent ANDs.
fn remove_features(spots: &mut Vec<AlignmentSpot>, params: &AlignmentParams) -> usize {
    let before = spots.len();
    spots.retain(|spot| {
        if spot.filter_status.is_blank_filtered && !params.keep_removable_features {
            return false;
        }
        match spot.annotation_category() {
            AnnotationCategory::RefMatched => params.keep_ref_matched,
            AnnotationCategory::Suggested => params.keep_suggested,
            AnnotationCategory::Unknown => params.keep_unknown,
        }
    });
    before - spots.len()
}

// ---------------------------------------------------------------------------
// Stage 8: final renumbering
// ---------------------------------------------------------------------------

/// Sorts ascending by (mass center, time center), reassigns both ids to the
/// 0-based rank, remaps link and correlation partners through an old-to-new
/// id table (dropping edges to removed spots) and renumbers the peak groups
/// from 0 in first-encounter order.
fn renumber(spots: &mut Vec<AlignmentSpot>) {
    spots.sort_by(|a, b| a.mz.total_cmp(&b.mz).then(a.rt.total_cmp(&b.rt)));

    let old_to_new: BTreeMap<usize, usize> = spots
        .iter()
        .enumerate()
        .map(|(idx, s)| (s.master_alignment_id, idx))
        .collect();

    let mut group_ids: BTreeMap<usize, usize> = BTreeMap::new();
    for (idx, spot) in spots.iter_mut().enumerate() {
        spot.master_alignment_id = idx;
        spot.alignment_id = idx;

        spot.character
            .peak_links
            .retain(|l| old_to_new.contains_key(&l.linked_peak_id));
        for link in spot.character.peak_links.iter_mut() {
            link.linked_peak_id = old_to_new[&link.linked_peak_id];
        }

        spot.correlations
            .retain(|c| old_to_new.contains_key(&c.partner_alignment_id));
        for corr in spot.correlations.iter_mut() {
            corr.partner_alignment_id = old_to_new[&corr.partner_alignment_id];
        }
        spot.correlations.sort_by_key(|c| c.partner_alignment_id);

        let next = group_ids.len();
        let group_id = *group_ids.entry(spot.character.peak_group_id).or_insert(next);
        spot.character.peak_group_id = group_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::peak::{MatchResult, PeakFeature};
    use crate::data::spot::{AlignedPeakProperty, AlignmentSpot};

    // powers of two so that fixture positions built as `base + k * tol` keep
    // exact deltas and boundary cases really sit on the boundary
    const MZ_TOL: f64 = 0.015625;
    const RT_TOL: f64 = 0.125;

    fn params(types: &[(usize, FileType)]) -> AlignmentParams {
        AlignmentParams {
            file_id_to_type: types.iter().copied().collect(),
            ms1_tolerance: MZ_TOL,
            retention_time_tolerance: RT_TOL,
            ..AlignmentParams::default()
        }
    }

    /// Dense spot: slot index == file id, one peak per file with the given height.
    fn spot(master_id: usize, mz: f64, rt: f64, heights: &[f64]) -> AlignmentSpot {
        let mut spot = AlignmentSpot::new(master_id, heights.len());
        spot.mz = mz;
        spot.rt = rt;
        for (file_id, &height) in heights.iter().enumerate() {
            let peak = PeakFeature::new(file_id, master_id * 100 + file_id, mz, rt, height);
            spot.aligned_peaks[file_id] = Some(AlignedPeakProperty::from_peak(&peak));
        }
        spot.update_height_average();
        spot
    }

    fn msp(reference_id: i64, score: f32, ms2: bool) -> MatchResult {
        MatchResult { reference_id, score, is_ms2_match: ms2, name: format!("ref_{}", reference_id) }
    }

    #[test]
    fn test_refine_base_scenario() {
        // 4 files: file 0 blank, files 1-3 sample; 4 spots offset by exactly
        // one tolerance per index -> nothing merges, nothing is removed
        let p = params(&[
            (0, FileType::Blank),
            (1, FileType::Sample),
            (2, FileType::Sample),
            (3, FileType::Sample),
        ]);
        let spots: Vec<AlignmentSpot> = (0..4)
            .map(|k| {
                spot(
                    k,
                    100.0 + k as f64 * MZ_TOL,
                    20.0 + k as f64 * RT_TOL,
                    &[0.0, 100.0, 110.0, 120.0],
                )
            })
            .collect();

        let refined = AlignmentRefiner::new(p).refine(spots);
        assert_eq!(refined.len(), 4);
        for (idx, s) in refined.iter().enumerate() {
            assert_eq!(s.alignment_id, idx);
            assert_eq!(s.master_alignment_id, idx);
            assert_eq!(s.character.peak_group_id, idx);
            assert!(!s.filter_status.is_blank_filtered);
        }
    }

    #[test]
    fn test_blank_filter_scenario() {
        // blanks {0,1} at 10000 -> blank average 10000, threshold 1000 at fold 0.1
        let mut p = params(&[
            (0, FileType::Blank),
            (1, FileType::Blank),
            (2, FileType::Sample),
            (3, FileType::Sample),
        ]);
        p.fold_change_for_blank_filtering = 0.1;
        p.blank_filtering = BlankFiltering::SampleMaxOverBlankAve;

        let sample_heights = [
            [900.0, 850.0],   // max 900  -> flagged
            [1100.0, 900.0],  // max 1100
            [1050.0, 1000.0], // max 1050
            [950.0, 900.0],   // max 950  -> flagged
            [1100.0, 1100.0], // max 1100
            [1000.0, 999.0],  // max 1000 == threshold -> NOT flagged (strict <)
        ];
        let spots: Vec<AlignmentSpot> = sample_heights
            .iter()
            .enumerate()
            .map(|(k, h)| spot(k, 100.0 + k as f64, 20.0, &[10000.0, 10000.0, h[0], h[1]]))
            .collect();

        let refined = AlignmentRefiner::new(p.clone()).refine(spots.clone());
        assert_eq!(refined.len(), 6);
        let flags: Vec<bool> = refined.iter().map(|s| s.filter_status.is_blank_filtered).collect();
        assert_eq!(flags, vec![true, false, false, true, false, false]);

        // dropping the keep flag removes the flagged spots entirely
        p.keep_removable_features = false;
        let removed = AlignmentRefiner::new(p).refine(spots);
        assert_eq!(removed.len(), 4);
        assert!(removed.iter().all(|s| !s.filter_status.is_blank_filtered));
    }

    #[test]
    fn test_blank_filter_average_mode_and_no_blank_degenerate() {
        let mut p = params(&[
            (0, FileType::Blank),
            (1, FileType::Sample),
            (2, FileType::Sample),
        ]);
        p.fold_change_for_blank_filtering = 1.0;
        p.blank_filtering = BlankFiltering::SampleAveOverBlankAve;

        // sample average 500 < blank 1000 -> flagged
        let flagged = spot(0, 100.0, 20.0, &[1000.0, 600.0, 400.0]);
        // sample average exactly 1000 -> not flagged
        let boundary = spot(1, 101.0, 20.0, &[1000.0, 1100.0, 900.0]);
        let refined = AlignmentRefiner::new(p).refine(vec![flagged, boundary]);
        assert!(refined[0].filter_status.is_blank_filtered);
        assert!(!refined[1].filter_status.is_blank_filtered);

        // no blank files at all: blank stat is 0.0, nothing is flagged
        let p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        let refined = AlignmentRefiner::new(p).refine(vec![spot(0, 100.0, 20.0, &[1.0, 2.0])]);
        assert!(!refined[0].filter_status.is_blank_filtered);
    }

    #[test]
    fn test_blank_filter_flags_just_below_threshold() {
        let mut p = params(&[(0, FileType::Blank), (1, FileType::Sample)]);
        p.fold_change_for_blank_filtering = 0.1;
        p.blank_filtering = BlankFiltering::SampleMaxOverBlankAve;

        // blank 10000 -> threshold 1000; a sample barely under it is flagged
        let barely = spot(0, 100.0, 20.0, &[10000.0, 1000.0 - 1e-9]);
        let refined = AlignmentRefiner::new(p).refine(vec![barely]);
        assert!(refined[0].filter_status.is_blank_filtered);
    }

    #[test]
    fn test_compression_scenario() {
        // 10 spots; pairs (0,1) and (4,5) sit inside both tolerances and
        // collapse onto the earlier spot, everything else stays
        let p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        let positions = [
            (100.0000, 20.00),
            (100.0099, 20.05), // inside both tolerances of spot 0 -> dropped
            (100.0500, 20.00),
            (100.0700, 21.00),
            (100.1000, 22.00),
            (100.1099, 22.05), // inside both tolerances of spot 4 -> dropped
            (100.1500, 23.00),
            (100.2000, 24.00),
            (100.3000, 25.00),
            (100.4000, 26.00),
        ];
        let spots: Vec<AlignmentSpot> = positions
            .iter()
            .enumerate()
            .map(|(k, &(mz, rt))| spot(k, mz, rt, &[100.0, 200.0]))
            .collect();

        let refined = AlignmentRefiner::new(p).refine(spots);
        assert_eq!(refined.len(), 8);
        let masses: Vec<f64> = refined.iter().map(|s| s.mz).collect();
        assert!(!masses.contains(&100.0099));
        assert!(!masses.contains(&100.1099));
        for (idx, s) in refined.iter().enumerate() {
            assert_eq!(s.alignment_id, idx);
            assert_eq!(s.master_alignment_id, idx);
        }
        assert!(masses.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_compression_keeps_exact_tolerance_neighbors() {
        let p = params(&[(0, FileType::Sample)]);
        let a = spot(0, 100.0, 20.0, &[100.0]);
        // exactly one mass tolerance away: strict < means no merge
        let b = spot(1, 100.0 + MZ_TOL, 20.0, &[100.0]);
        let refined = AlignmentRefiner::new(p).refine(vec![a, b]);
        assert_eq!(refined.len(), 2);
    }

    #[test]
    fn test_dedup_msp_top_hit_only() {
        let mut p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        p.only_report_top_hit_in_msp_search = true;

        let mut spots: Vec<AlignmentSpot> = (0..3)
            .map(|k| spot(k, 100.0 + k as f64, 20.0, &[100.0, 200.0]))
            .collect();
        // all three annotated against reference 7; 0.9 tie between spots 1 and 2
        spots[0].msp_matches.insert(0, msp(7, 0.6, true));
        spots[1].msp_matches.insert(0, msp(7, 0.9, true));
        spots[2].msp_matches.insert(0, msp(7, 0.9, true));
        for s in spots.iter_mut() {
            s.name = "ref_7".to_string();
        }

        let refined = AlignmentRefiner::new(p).refine(spots);
        let named: Vec<&AlignmentSpot> = refined.iter().filter(|s| !s.name.is_empty()).collect();
        assert_eq!(named.len(), 1);
        // tie broken toward the first-encountered spot (original index 1, mz 101)
        assert!((named[0].mz - 101.0).abs() < 1e-9);
        assert_eq!(refined.iter().filter(|s| !s.msp_matches.is_empty()).count(), 1);
    }

    #[test]
    fn test_dedup_text_db_top_hit_only() {
        let mut p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        p.only_report_top_hit_in_text_db_search = true;

        let mut spots: Vec<AlignmentSpot> = (0..2)
            .map(|k| spot(k, 100.0 + k as f64, 20.0, &[100.0, 200.0]))
            .collect();
        spots[0].text_db_match = Some(msp(3, 0.5, false));
        spots[0].name = "ref_3".to_string();
        spots[1].text_db_match = Some(msp(3, 0.8, false));
        spots[1].name = "ref_3".to_string();

        let refined = AlignmentRefiner::new(p).refine(spots);
        assert!(refined[0].text_db_match.is_none());
        assert!(refined[0].name.is_empty());
        assert!(refined[1].text_db_match.is_some());
        assert_eq!(refined[1].name, "ref_3");
    }

    #[test]
    fn test_correlation_linking() {
        let p = params(&[
            (0, FileType::Sample),
            (1, FileType::Sample),
            (2, FileType::Sample),
        ]);
        let a = spot(0, 100.0, 20.0, &[100.0, 200.0, 300.0]);
        let b = spot(1, 101.0, 20.0, &[10.0, 20.0, 30.0]); // r = 1.0 with a
        let c = spot(2, 102.0, 20.0, &[300.0, 200.0, 100.0]); // anticorrelated
        let d = spot(3, 103.0, 20.0, &[50.0, 50.0, 50.0]); // zero variance

        let refined = AlignmentRefiner::new(p).refine(vec![a, b, c, d]);
        let correl = |s: &AlignmentSpot| -> Vec<usize> {
            s.character
                .peak_links
                .iter()
                .filter(|l| l.character == PeakLinkCharacter::CorrelSimilar)
                .map(|l| l.linked_peak_id)
                .collect()
        };
        assert_eq!(correl(&refined[0]), vec![1]);
        assert_eq!(correl(&refined[1]), vec![0]);
        assert!(correl(&refined[2]).is_empty());
        assert!(correl(&refined[3]).is_empty());

        assert_eq!(refined[0].correlations.len(), 1);
        assert_eq!(refined[0].correlations[0].partner_alignment_id, 1);
        assert!((refined[0].correlations[0].correlation - 1.0).abs() < 1e-9);
        assert_eq!(refined[1].correlations[0].partner_alignment_id, 0);

        // correlation links never merge peak groups
        assert_ne!(refined[0].character.peak_group_id, refined[1].character.peak_group_id);
    }

    #[test]
    fn test_correlation_skips_isotope_partners() {
        let p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        let mut a = spot(0, 100.0, 20.0, &[100.0, 200.0]);
        let b = spot(1, 101.003, 20.0, &[50.0, 100.0]); // r = 1.0 with a
        // upstream characterization marked b's file-0 peak as an isotope of a's
        let b_peak_id = b.aligned_peaks[0].as_ref().unwrap().peak_id;
        a.aligned_peaks[0]
            .as_mut()
            .unwrap()
            .character
            .peak_links
            .push(LinkedPeakFeature {
                linked_peak_id: b_peak_id,
                character: PeakLinkCharacter::Isotope,
            });

        let refined = AlignmentRefiner::new(p).refine(vec![a, b]);
        assert!(refined[0].correlations.is_empty());
        assert!(refined[1].correlations.is_empty());
        assert!(refined[0]
            .character
            .peak_links
            .iter()
            .all(|l| l.character != PeakLinkCharacter::CorrelSimilar));
    }

    #[test]
    fn test_link_registration_symmetry_and_grouping() {
        let p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        // representative slot of spot 0 is file 0 (highest peak); its peak
        // carries a one-directional adduct link to spot 1's file-0 peak
        let mut a = spot(0, 100.0, 20.0, &[500.0, 100.0]);
        let b = spot(1, 122.0, 20.0, &[400.0, 100.0]);
        let c = spot(2, 150.0, 25.0, &[300.0, 100.0]);
        let b_peak_id = b.aligned_peaks[0].as_ref().unwrap().peak_id;
        a.aligned_peaks[0]
            .as_mut()
            .unwrap()
            .character
            .peak_links
            .push(LinkedPeakFeature {
                linked_peak_id: b_peak_id,
                character: PeakLinkCharacter::Adduct,
            });

        let refined = AlignmentRefiner::new(p).refine(vec![a, b, c]);
        assert_eq!(refined[0].representative_file_id, 0);

        let has_link = |s: &AlignmentSpot, partner: usize, ch: PeakLinkCharacter| {
            s.character
                .peak_links
                .iter()
                .any(|l| l.linked_peak_id == partner && l.character == ch)
        };
        // adduct link registered on spot 0 and mirrored onto spot 1
        assert!(has_link(&refined[0], 1, PeakLinkCharacter::Adduct));
        assert!(has_link(&refined[1], 0, PeakLinkCharacter::Adduct));

        // grouping follows the connected components of the adduct graph
        assert_eq!(refined[0].character.peak_group_id, 0);
        assert_eq!(refined[1].character.peak_group_id, 0);
        assert_eq!(refined[2].character.peak_group_id, 1);
    }

    #[test]
    fn test_representative_prefers_annotated_slot() {
        let p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        let mut a = spot(0, 100.0, 20.0, &[500.0, 100.0]);
        // the smaller peak carries an MS2-confirmed annotation and wins
        a.aligned_peaks[1].as_mut().unwrap().msp_match = Some(msp(11, 0.8, true));
        a.msp_matches.insert(1, msp(11, 0.8, true));

        let refined = AlignmentRefiner::new(p).refine(vec![a]);
        assert_eq!(refined[0].representative_file_id, 1);
        assert_eq!(refined[0].name, "ref_11");
    }

    #[test]
    fn test_removal_by_annotation_category() {
        let mut p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        p.keep_ref_matched = true;
        p.keep_suggested = false;
        p.keep_unknown = false;

        let mut ref_matched = spot(0, 100.0, 20.0, &[100.0, 200.0]);
        ref_matched.msp_matches.insert(0, msp(1, 0.9, true));
        let mut suggested = spot(1, 101.0, 20.0, &[100.0, 200.0]);
        suggested.msp_matches.insert(0, msp(2, 0.7, false));
        let unknown = spot(2, 102.0, 20.0, &[100.0, 200.0]);

        let refined =
            AlignmentRefiner::new(p).refine(vec![ref_matched, suggested, unknown]);
        assert_eq!(refined.len(), 1);
        assert_eq!(refined[0].msp_matches.get(&0).map(|m| m.reference_id), Some(1));
        assert_eq!(refined[0].alignment_id, 0);
    }

    #[test]
    fn test_removal_drops_dangling_partners() {
        let mut p = params(&[
            (0, FileType::Blank),
            (1, FileType::Sample),
            (2, FileType::Sample),
        ]);
        p.fold_change_for_blank_filtering = 5.0;
        p.keep_removable_features = false;

        // spot 1 dies to the blank filter; spot 0 survives with a link to it
        // (the link sits on file 1, spot 0's representative slot)
        let mut a = spot(0, 100.0, 20.0, &[10.0, 6000.0, 5000.0]);
        let b = spot(1, 122.0, 20.0, &[1000.0, 10.0, 20.0]);
        let b_peak_id = b.aligned_peaks[1].as_ref().unwrap().peak_id;
        a.aligned_peaks[1]
            .as_mut()
            .unwrap()
            .character
            .peak_links
            .push(LinkedPeakFeature {
                linked_peak_id: b_peak_id,
                character: PeakLinkCharacter::Adduct,
            });

        let refined = AlignmentRefiner::new(p).refine(vec![a, b]);
        assert_eq!(refined.len(), 1);
        assert!(refined[0].character.peak_links.is_empty());
        assert!(refined[0].correlations.is_empty());
        assert_eq!(refined[0].character.peak_group_id, 0);
    }

    #[test]
    fn test_renumbering_sorts_by_mass_then_time() {
        let p = params(&[(0, FileType::Sample), (1, FileType::Sample)]);
        let spots = vec![
            spot(0, 200.0, 20.0, &[100.0, 110.0]),
            spot(1, 100.0, 30.0, &[120.0, 130.0]),
            spot(2, 100.0, 10.0, &[140.0, 150.0]),
        ];
        let refined = AlignmentRefiner::new(p).refine(spots);
        let order: Vec<(f64, f64)> = refined.iter().map(|s| (s.mz, s.rt)).collect();
        assert_eq!(order, vec![(100.0, 10.0), (100.0, 30.0), (200.0, 20.0)]);
        for (idx, s) in refined.iter().enumerate() {
            assert_eq!(s.master_alignment_id, idx);
            assert_eq!(s.alignment_id, idx);
        }
    }

    #[test]
    fn test_refine_is_idempotent() {
        let p = params(&[
            (0, FileType::Blank),
            (1, FileType::Sample),
            (2, FileType::Sample),
        ]);
        // a mix of near-duplicates, correlated pairs and peak links; the
        // adduct link sits on file 1, spot a's representative slot
        let mut a = spot(0, 100.0, 20.0, &[10.0, 200.0, 100.0]);
        let dup = spot(1, 100.005, 20.01, &[10.0, 180.0, 90.0]);
        let b = spot(2, 122.0, 20.0, &[10.0, 50.0, 100.0]);
        let c = spot(3, 150.0, 20.2, &[10.0, 300.0, 150.0]);
        let b_peak_id = b.aligned_peaks[1].as_ref().unwrap().peak_id;
        a.aligned_peaks[1]
            .as_mut()
            .unwrap()
            .character
            .peak_links
            .push(LinkedPeakFeature {
                linked_peak_id: b_peak_id,
                character: PeakLinkCharacter::Adduct,
            });

        let refiner = AlignmentRefiner::new(p);
        let once = refiner.refine(vec![a, dup, b, c]);
        assert_eq!(once.len(), 3);
        let twice = refiner.refine(once.clone());
        assert_eq!(twice, once);
    }

    #[test]
    fn test_join_then_refine_end_to_end() {
        use crate::align::join::{join, VecPeakSource};
        use crate::data::file::AnalysisFile;

        let files = vec![
            AnalysisFile::new(0, "blank", FileType::Blank, 0),
            AnalysisFile::new(1, "sample_a", FileType::Sample, 1),
            AnalysisFile::new(2, "sample_b", FileType::Sample, 2),
        ];
        let mut p = AlignmentParams::from_files(&files);
        p.ms1_tolerance = MZ_TOL;
        p.retention_time_tolerance = RT_TOL;
        p.keep_removable_features = false;

        let mut source = VecPeakSource::new();
        // the feature at m/z 100 is dominated by the blank run
        source.insert(0, vec![PeakFeature::new(0, 0, 100.001, 10.01, 5000.0)]);
        source.insert(1, vec![
            PeakFeature::new(1, 0, 100.0, 10.0, 1000.0),
            PeakFeature::new(1, 1, 150.0, 12.0, 2000.0),
            PeakFeature::new(1, 2, 200.0, 14.0, 3000.0),
        ]);
        source.insert(2, vec![
            PeakFeature::new(2, 0, 100.002, 10.02, 900.0),
            PeakFeature::new(2, 1, 150.004, 12.03, 2100.0),
            PeakFeature::new(2, 2, 250.0, 16.0, 500.0),
        ]);

        let spots = join(&files, 1, &source, &p);
        assert_eq!(spots.len(), 4);

        let refined = AlignmentRefiner::new(p).refine(spots);
        let masses: Vec<f64> = refined.iter().map(|s| s.mz).collect();
        assert_eq!(masses, vec![150.0, 200.0, 250.0]);
        for (idx, s) in refined.iter().enumerate() {
            assert_eq!(s.aligned_peaks.len(), files.len());
            assert_eq!(s.master_alignment_id, idx);
            assert_eq!(s.alignment_id, idx);
            assert!(!s.filter_status.is_blank_filtered);
        }
        assert_eq!(refined[0].filled_slot_count(), 2);
        assert_eq!(refined[1].filled_slot_count(), 1);
        assert_eq!(refined[2].filled_slot_count(), 1);
    }

    #[test]
    fn test_empty_input() {
        let p = params(&[(0, FileType::Sample)]);
        assert!(AlignmentRefiner::new(p).refine(Vec::new()).is_empty());
    }
}
