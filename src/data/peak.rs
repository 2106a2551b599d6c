use serde::{Deserialize, Serialize};

/// Character of a typed, directed relationship between two peaks or spots.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum PeakLinkCharacter {
    /// Same molecule detected twice (e.g. split peak).
    SameFeature,
    Isotope,
    Adduct,
    /// Chromatographic profile similarity found during per-run characterization.
    ChromSimilar,
    /// Height-profile correlation across samples, assigned by the refiner.
    CorrelSimilar,
    /// Observed as a fragment in a higher collision-energy MS/MS trace.
    FoundInUpperMsMs,
}

impl PeakLinkCharacter {
    /// Links of this character take part in peak grouping. Correlation links
    /// are informational only and never merge groups.
    #[inline]
    pub fn is_grouping(&self) -> bool {
        !matches!(self, PeakLinkCharacter::CorrelSimilar)
    }
}

/// Directed edge to a partner peak (per-file id space) or partner spot
/// (master alignment id space). Intended to be symmetric in final results.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LinkedPeakFeature {
    pub linked_peak_id: usize,
    pub character: PeakLinkCharacter,
}

/// Ion-level annotation shared by per-file peaks and alignment spots.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct IonFeatureCharacter {
    pub isotope_weight_number: i32,
    pub charge: i32,
    pub adduct: String,
    pub peak_links: Vec<LinkedPeakFeature>,
    pub peak_group_id: usize,
}

/// Outcome of matching a feature against a spectral or text reference library.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct MatchResult {
    /// Index into the external reference library; negative means unannotated.
    pub reference_id: i64,
    pub score: f32,
    /// True when the annotation was confirmed by an MS2 spectrum.
    pub is_ms2_match: bool,
    pub name: String,
}

impl MatchResult {
    #[inline]
    pub fn is_annotated(&self) -> bool {
        self.reference_id >= 0
    }
}

/// One detected chromatographic feature in a single run.
///
/// Produced upstream by peak picking and deconvolution; the alignment core
/// treats the per-file peak lists as read-only and sorted ascending by m/z.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PeakFeature {
    pub file_id: usize,
    /// Id unique within the owning file.
    pub peak_id: usize,
    pub mz: f64,
    pub rt: f64,
    pub height: f64,
    pub area: f64,
    pub character: IonFeatureCharacter,
    pub msp_match: Option<MatchResult>,
    pub text_db_match: Option<MatchResult>,
}

impl PeakFeature {
    pub fn new(file_id: usize, peak_id: usize, mz: f64, rt: f64, height: f64) -> Self {
        Self {
            file_id,
            peak_id,
            mz,
            rt,
            height,
            area: height,
            character: IonFeatureCharacter::default(),
            msp_match: None,
            text_db_match: None,
        }
    }

    /// True when either library search produced an annotation for this peak.
    #[inline]
    pub fn is_annotated(&self) -> bool {
        self.msp_match.as_ref().map_or(false, |m| m.is_annotated())
            || self.text_db_match.as_ref().map_or(false, |m| m.is_annotated())
    }

    /// True when the peak carries an MS2-confirmed annotation.
    #[inline]
    pub fn is_ms2_annotated(&self) -> bool {
        self.msp_match.as_ref().map_or(false, |m| m.is_annotated() && m.is_ms2_match)
    }
}
