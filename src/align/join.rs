use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::align::params::AlignmentParams;
use crate::align::utility::{alignment_distance, within_tolerance};
use crate::data::file::AnalysisFile;
use crate::data::peak::PeakFeature;
use crate::data::spot::{AlignedPeakProperty, AlignmentSpot};

/// Supplier of per-file peak lists, each sorted ascending by m/z.
///
/// Implemented by the raw-data/deconvolution subsystem; `VecPeakSource`
/// is the in-memory implementation used in tests and small pipelines.
pub trait PeakSource {
    fn peaks_of(&self, file_id: usize) -> &[PeakFeature];
}

#[derive(Clone, Debug, Default)]
pub struct VecPeakSource {
    by_file: BTreeMap<usize, Vec<PeakFeature>>,
}

impl VecPeakSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peak list for a file, sorting it ascending by m/z.
    pub fn insert(&mut self, file_id: usize, mut peaks: Vec<PeakFeature>) {
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        self.by_file.insert(file_id, peaks);
    }
}

impl PeakSource for VecPeakSource {
    fn peaks_of(&self, file_id: usize) -> &[PeakFeature] {
        self.by_file.get(&file_id).map_or(&[], |v| v.as_slice())
    }
}

/// Pulls per-run library hits up onto the spot: one MSP entry per annotated
/// run, the best text hit, and a consensus name from the strongest match.
fn collect_annotations(spot: &mut AlignmentSpot) {
    for slot in spot.aligned_peaks.iter().flatten() {
        if let Some(m) = &slot.msp_match {
            if m.is_annotated() {
                spot.msp_matches.insert(slot.file_id, m.clone());
            }
        }
        if let Some(m) = &slot.text_db_match {
            if m.is_annotated() {
                match &spot.text_db_match {
                    Some(best) if m.score <= best.score => {}
                    _ => spot.text_db_match = Some(m.clone()),
                }
            }
        }
    }
    if spot.name.is_empty() {
        if let Some(m) = spot.best_msp_match().filter(|m| m.is_annotated()) {
            spot.name = m.name.clone();
        } else if let Some(m) = &spot.text_db_match {
            spot.name = m.name.clone();
        }
    }
}

/// Index of the best not-yet-consumed correspondence candidate for an anchor
/// inside one mass-sorted peak list, or `None` when no peak passes both
/// strict tolerance gates.
fn best_candidate(
    peaks: &[PeakFeature],
    used: &[bool],
    anchor_mz: f64,
    anchor_rt: f64,
    params: &AlignmentParams,
) -> Option<usize> {
    let mz_tol = params.ms1_tolerance;
    let rt_tol = params.retention_time_tolerance;

    // lower bound of the candidate window in the mass-sorted list
    let start = peaks.partition_point(|p| p.mz <= anchor_mz - mz_tol);

    let mut best: Option<(usize, f64)> = None;
    for (offset, peak) in peaks[start..].iter().enumerate() {
        if peak.mz >= anchor_mz + mz_tol {
            break;
        }
        let idx = start + offset;
        if used[idx] {
            continue;
        }
        if !within_tolerance(peak.mz, anchor_mz, mz_tol)
            || !within_tolerance(peak.rt, anchor_rt, rt_tol)
        {
            continue;
        }
        let d = alignment_distance(peak.mz - anchor_mz, peak.rt - anchor_rt, mz_tol, rt_tol);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((idx, d)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Joins independently detected peak lists into one ordered list of
/// alignment spots, one optional slot per input file.
///
/// The master file's peaks seed the output in mass order; each anchors a
/// spot at its (m/z, rt). Every other file contributes its closest
/// unconsumed peak inside both strict tolerances. Peaks that match no
/// anchor are promoted into single-slot spots and spliced in so the result
/// stays ascending in mass.
pub fn join(
    files: &[AnalysisFile],
    master_file_index: usize,
    source: &impl PeakSource,
    params: &AlignmentParams,
) -> Vec<AlignmentSpot> {
    if files.is_empty() {
        return Vec::new();
    }
    let n_files = files.len();
    let master_file_index = master_file_index.min(n_files - 1);
    let master_file_id = files[master_file_index].file_id;

    let peak_lists: Vec<&[PeakFeature]> = files.iter().map(|f| source.peaks_of(f.file_id)).collect();
    let mut used: Vec<Vec<bool>> = peak_lists.iter().map(|l| vec![false; l.len()]).collect();

    // one spot per master peak, anchored at the master peak
    let mut spots: Vec<AlignmentSpot> = Vec::with_capacity(peak_lists[master_file_index].len());
    for (idx, anchor) in peak_lists[master_file_index].iter().enumerate() {
        used[master_file_index][idx] = true;

        let mut spot = AlignmentSpot::new(spots.len(), n_files);
        spot.mz = anchor.mz;
        spot.rt = anchor.rt;
        spot.representative_file_id = master_file_id;
        spot.character.isotope_weight_number = anchor.character.isotope_weight_number;
        spot.character.charge = anchor.character.charge;
        spot.character.adduct = anchor.character.adduct.clone();
        spot.aligned_peaks[master_file_index] = Some(AlignedPeakProperty::from_peak(anchor));

        for (file_idx, peaks) in peak_lists.iter().enumerate() {
            if file_idx == master_file_index {
                continue;
            }
            if let Some(pick) = best_candidate(peaks, &used[file_idx], anchor.mz, anchor.rt, params)
            {
                used[file_idx][pick] = true;
                spot.aligned_peaks[file_idx] = Some(AlignedPeakProperty::from_peak(&peaks[pick]));
            }
        }
        spots.push(spot);
    }

    // promote unmatched peaks of non-master files into their own spots
    let mut orphans: Vec<AlignmentSpot> = Vec::new();
    for (file_idx, peaks) in peak_lists.iter().enumerate() {
        if file_idx == master_file_index {
            continue;
        }
        for (idx, peak) in peaks.iter().enumerate() {
            if used[file_idx][idx] {
                continue;
            }
            let mut spot = AlignmentSpot::new(0, n_files);
            spot.mz = peak.mz;
            spot.rt = peak.rt;
            spot.representative_file_id = peak.file_id;
            spot.character.isotope_weight_number = peak.character.isotope_weight_number;
            spot.character.charge = peak.character.charge;
            spot.character.adduct = peak.character.adduct.clone();
            spot.aligned_peaks[file_idx] = Some(AlignedPeakProperty::from_peak(peak));
            orphans.push(spot);
        }
    }
    orphans.sort_by(|a, b| a.mz.total_cmp(&b.mz).then(a.rt.total_cmp(&b.rt)));

    // splice: merge two mass-sorted lists, anchored spots first on equal mass
    let mut merged: Vec<AlignmentSpot> = spots
        .into_iter()
        .merge_by(orphans, |anchored, orphan| anchored.mz <= orphan.mz)
        .collect();

    for (idx, spot) in merged.iter_mut().enumerate() {
        spot.master_alignment_id = idx;
        spot.alignment_id = idx;
        spot.update_height_average();
        collect_annotations(spot);
    }

    debug!(
        "joined {} files into {} spots (master file id {})",
        n_files,
        merged.len(),
        master_file_id
    );
    merged
}
