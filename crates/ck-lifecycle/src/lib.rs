pub mod deploy;
pub mod pipeline;
pub mod types;

pub use deploy::{DeployAdapter, DeployContext, DeployDispatcher, DeployReport, LogOnlyAdapter};
pub use pipeline::LifecyclePipeline;
pub use types::{CreateOrRenewOptions, CreateOrRenewOutcome, DeleteOptions, RestoreOutcome};
