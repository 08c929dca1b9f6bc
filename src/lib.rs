#![deny(dead_code)]
#![deny(unused_imports)]

pub mod consensus;
pub mod kernel;
pub mod model;
pub mod oracle;
pub mod rj;
pub mod sampler;
pub mod score;
pub mod types;

pub use consensus::{co_membership, dahl_partition, mode_partition, ConsensusError, DahlConsensus};
pub use kernel::{kernel_weights, KernelError};
pub use model::{GwrModel, ModelSpecError};
pub use oracle::{
    build_partition_ensemble, ClusteringOracle, DroppedDraw, EnsembleConfig, FitFailure,
    GaussianMixtureOracle, OracleError, OracleFit, PartitionEnsemble, SelectionCriterion,
};
pub use rj::RjConfig;
pub use sampler::{
    GibbsMetropolisSampler, McmcConfig, PosteriorDraws, Sampler, SamplerError,
};
pub use score::{rand_index, ScoreError};
pub use types::{
    default_distance_max, DistanceMatrix, DistanceMatrixError, PriorConfig, SpatialUnit,
};
