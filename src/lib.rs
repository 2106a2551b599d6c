pub mod data {
    pub mod file;
    pub mod peak;
    pub mod spot;
}

pub mod align {
    pub mod params;
    pub mod join;
    pub mod refine;
    pub mod utility;
}

// Re-export commonly used types
pub use align::join::{join, PeakSource, VecPeakSource};
pub use align::params::{AlignmentParams, BlankFiltering};
pub use align::refine::AlignmentRefiner;
