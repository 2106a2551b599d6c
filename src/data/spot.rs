use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::peak::{IonFeatureCharacter, LinkedPeakFeature, MatchResult, PeakFeature};

/// Snapshot of one per-file peak inside an alignment spot. The slot keeps the
/// values the consensus table reports per run, decoupled from the upstream
/// `PeakFeature` list.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AlignedPeakProperty {
    pub file_id: usize,
    pub peak_id: usize,
    pub mz: f64,
    pub rt: f64,
    pub height: f64,
    pub area: f64,
    pub character: IonFeatureCharacter,
    pub msp_match: Option<MatchResult>,
    pub text_db_match: Option<MatchResult>,
}

impl AlignedPeakProperty {
    pub fn from_peak(peak: &PeakFeature) -> Self {
        Self {
            file_id: peak.file_id,
            peak_id: peak.peak_id,
            mz: peak.mz,
            rt: peak.rt,
            height: peak.height,
            area: peak.area,
            character: peak.character.clone(),
            msp_match: peak.msp_match.clone(),
            text_db_match: peak.text_db_match.clone(),
        }
    }
}

/// Boolean filter flags accumulated during refinement.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct FeatureFilterStatus {
    pub is_blank_filtered: bool,
}

/// Signed cross-sample height correlation with a partner spot.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SpotVariableCorrelation {
    pub partner_alignment_id: usize,
    pub correlation: f64,
}

/// Annotation confidence class of a spot, derived from its match results.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AnnotationCategory {
    /// Annotated and confirmed by MS2 or a text reference entry.
    RefMatched,
    /// Annotated without MS2 evidence.
    Suggested,
    Unknown,
}

/// One row of the consensus alignment table: the same chemical feature
/// observed (or missing) across all input files.
///
/// Spots are created by the joiner, mutated in place by each refiner stage
/// and immutable once refinement completes. Both ids equal the 0-based rank
/// in the final (mass, time)-sorted table.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AlignmentSpot {
    pub master_alignment_id: usize,
    pub alignment_id: usize,
    /// File whose peak supplied the spot-level adduct/charge/links.
    pub representative_file_id: usize,
    /// Mass center (m/z) of the consensus feature.
    pub mz: f64,
    /// Time center (retention time) of the consensus feature.
    pub rt: f64,
    pub height_average: f64,
    /// One slot per input file, in input-file order. `None` = not detected.
    pub aligned_peaks: Vec<Option<AlignedPeakProperty>>,
    /// MSP search results keyed by raw run id; several runs may match the
    /// same reference.
    pub msp_matches: BTreeMap<usize, MatchResult>,
    pub text_db_match: Option<MatchResult>,
    pub name: String,
    pub character: IonFeatureCharacter,
    pub filter_status: FeatureFilterStatus,
    /// Sorted ascending by partner id.
    pub correlations: Vec<SpotVariableCorrelation>,
}

impl AlignmentSpot {
    /// Creates an empty spot with `n_files` unfilled slots.
    pub fn new(master_alignment_id: usize, n_files: usize) -> Self {
        Self {
            master_alignment_id,
            alignment_id: master_alignment_id,
            representative_file_id: 0,
            mz: 0.0,
            rt: 0.0,
            height_average: 0.0,
            aligned_peaks: vec![None; n_files],
            msp_matches: BTreeMap::new(),
            text_db_match: None,
            name: String::new(),
            character: IonFeatureCharacter::default(),
            filter_status: FeatureFilterStatus::default(),
            correlations: Vec::new(),
        }
    }

    /// Number of files in which the feature was actually detected.
    pub fn filled_slot_count(&self) -> usize {
        self.aligned_peaks.iter().filter(|p| p.is_some()).count()
    }

    /// Recomputes the average height over filled slots; 0.0 when empty.
    pub fn update_height_average(&mut self) {
        let filled: Vec<f64> = self
            .aligned_peaks
            .iter()
            .flatten()
            .map(|p| p.height)
            .collect();
        self.height_average = if filled.is_empty() {
            0.0
        } else {
            filled.iter().sum::<f64>() / filled.len() as f64
        };
    }

    /// Best MSP hit over all raw runs: maximum score, earliest run id on ties.
    pub fn best_msp_match(&self) -> Option<&MatchResult> {
        let mut best: Option<&MatchResult> = None;
        for m in self.msp_matches.values() {
            match best {
                Some(b) if m.score <= b.score => {}
                _ => best = Some(m),
            }
        }
        best
    }

    /// Reference id of the best annotated MSP hit, if any.
    pub fn top_msp_reference(&self) -> Option<i64> {
        self.best_msp_match()
            .filter(|m| m.is_annotated())
            .map(|m| m.reference_id)
    }

    /// Reference id of the text-library hit, if annotated.
    pub fn text_db_reference(&self) -> Option<i64> {
        self.text_db_match
            .as_ref()
            .filter(|m| m.is_annotated())
            .map(|m| m.reference_id)
    }

    /// Derives the annotation confidence class used by feature removal.
    pub fn annotation_category(&self) -> AnnotationCategory {
        if self.text_db_reference().is_some() {
            return AnnotationCategory::RefMatched;
        }
        match self.best_msp_match().filter(|m| m.is_annotated()) {
            Some(m) if m.is_ms2_match => AnnotationCategory::RefMatched,
            Some(_) => AnnotationCategory::Suggested,
            None => AnnotationCategory::Unknown,
        }
    }

    /// True when this spot and `other` are marked as isotopes of one another.
    pub fn is_isotope_pair_with(&self, other_master_id: usize) -> bool {
        self.character.peak_links.iter().any(|l| {
            l.linked_peak_id == other_master_id
                && l.character == crate::data::peak::PeakLinkCharacter::Isotope
        })
    }

    /// Adds a link, collapsing duplicates on `(partner, character)`.
    pub fn add_link(&mut self, link: LinkedPeakFeature) {
        if !self.character.peak_links.contains(&link) {
            self.character.peak_links.push(link);
        }
    }
}
