use serde::{Deserialize, Serialize};

/// Role of an analysis run in the experiment design.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FileType {
    Sample,
    Standard,
    QualityControl,
    Blank,
}

impl FileType {
    /// Returns the `FileType` corresponding to the given integer value.
    pub fn new(file_type: i32) -> FileType {
        match file_type {
            0 => FileType::Sample,
            1 => FileType::Standard,
            2 => FileType::QualityControl,
            3 => FileType::Blank,
            _ => FileType::Sample,
        }
    }

    /// Returns the integer value corresponding to the `FileType`.
    pub fn file_type_numeric(&self) -> i32 {
        match self {
            FileType::Sample => 0,
            FileType::Standard => 1,
            FileType::QualityControl => 2,
            FileType::Blank => 3,
        }
    }
}

/// Immutable identity of one chromatographic run.
///
/// Produced by the surrounding application when raw files are registered;
/// the alignment core only reads it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AnalysisFile {
    pub file_id: usize,
    pub file_name: String,
    pub file_type: FileType,
    /// Position of the run in the acquisition sequence.
    pub analytical_order: usize,
}

impl AnalysisFile {
    pub fn new(file_id: usize, file_name: &str, file_type: FileType, analytical_order: usize) -> Self {
        Self {
            file_id,
            file_name: file_name.to_string(),
            file_type,
            analytical_order,
        }
    }
}
