pub mod classify;
pub mod error;
pub mod features;
pub mod model;
pub mod patient;
pub mod personalize;
pub mod pipeline;
pub mod simulator;

pub use crate::classify::{Assignment, ClassifierMode, TrainedClassifier};
pub use crate::features::{FeatureRule, FeatureSchema, FeatureVector};
pub use crate::model::{NetworkBuilder, RateLaw, ReactionNetwork, ReactionSpec};
pub use crate::patient::{Adjustment, Cohort, PatientSpec};
pub use crate::personalize::{personalize, PatientParameters};
pub use crate::pipeline::{CohortResult, Condition, Pipeline, PipelineConfig};
pub use crate::simulator::{
    simulate, SolverMethod, SolverOptions, TimeGrid, Trajectory, TrajectoryStatus,
};
pub use error::DynotypeError;

pub mod prelude {
    pub mod model {
        pub use crate::model::{
            NetworkBuilder, Parameter, Range, RateLaw, ReactionNetwork, ReactionSpec, Species,
        };
    }
    pub mod simulator {
        pub use crate::simulator::{
            simulate, simulate_with_cache, SolverMethod, SolverOptions, TimeGrid, Trajectory,
            TrajectoryStatus,
        };
    }
    pub mod pipeline {
        pub use crate::pipeline::{
            CohortResult, Condition, PatientRecord, Pipeline, PipelineConfig,
        };
    }

    pub use crate::classify::{Assignment, ClassifierMode, KMeans, NearestCentroid};
    pub use crate::features::{extract, FeatureRule, FeatureSchema, FeatureVector};
    pub use crate::patient::{Adjustment, Cohort, PatientSpec};
    pub use crate::personalize::{personalize, personalize_with_overrides, PatientParameters};
    pub use crate::DynotypeError;
}
