pub mod classifiers;
pub mod connectivity;
pub mod covariance;
pub mod cross_validation;
pub mod features;
pub mod linalg;
pub mod output;
pub mod pipeline;
pub mod stats;
