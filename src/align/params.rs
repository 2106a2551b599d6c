use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::file::{AnalysisFile, FileType};

/// How the sample-side statistic of the blank filter is aggregated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BlankFiltering {
    SampleMaxOverBlankAve,
    SampleAveOverBlankAve,
}

/// Immutable configuration shared by the joiner and every refiner stage.
///
/// Passed by reference into each stage so stages stay unit-testable on their
/// own, without the surrounding application's parameter tree.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AlignmentParams {
    pub file_id_to_type: BTreeMap<usize, FileType>,
    /// Retention-time alignment tolerance (minutes). Strict `<` everywhere.
    pub retention_time_tolerance: f64,
    /// MS1 mass alignment tolerance (Da). Strict `<` everywhere.
    pub ms1_tolerance: f64,
    pub blank_filtering: BlankFiltering,
    pub fold_change_for_blank_filtering: f64,
    pub only_report_top_hit_in_msp_search: bool,
    pub only_report_top_hit_in_text_db_search: bool,
    /// Keep blank-filtered spots in the table (flagged) for manual checking.
    pub keep_removable_features: bool,
    pub keep_ref_matched: bool,
    pub keep_suggested: bool,
    pub keep_unknown: bool,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            file_id_to_type: BTreeMap::new(),
            retention_time_tolerance: 0.05,
            ms1_tolerance: 0.015,
            blank_filtering: BlankFiltering::SampleMaxOverBlankAve,
            fold_change_for_blank_filtering: 5.0,
            only_report_top_hit_in_msp_search: false,
            only_report_top_hit_in_text_db_search: false,
            keep_removable_features: true,
            keep_ref_matched: true,
            keep_suggested: true,
            keep_unknown: true,
        }
    }
}

impl AlignmentParams {
    /// Builds the file-type map from run descriptors; other fields default.
    pub fn from_files(files: &[AnalysisFile]) -> Self {
        Self {
            file_id_to_type: files.iter().map(|f| (f.file_id, f.file_type)).collect(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn file_type(&self, file_id: usize) -> FileType {
        *self.file_id_to_type.get(&file_id).unwrap_or(&FileType::Sample)
    }

    /// File ids of the given type, ascending. The refiner relies on this
    /// order for reproducible height vectors.
    pub fn file_ids_of_type(&self, file_type: FileType) -> Vec<usize> {
        self.file_id_to_type
            .iter()
            .filter(|(_, t)| **t == file_type)
            .map(|(id, _)| *id)
            .collect()
    }
}
