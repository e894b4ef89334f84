//! stratus-lifecycle — cluster lifecycle orchestration.
//!
//! A single action runs top to bottom in one process; nothing is kept
//! between invocations. Every fact about a cluster is rediscovered from
//! the provider through isolation-group membership.
//!
//! ```text
//!                    LifecycleController
//!      ┌──────────┬────────┼──────────┬──────────────┐
//!      ▼          ▼        ▼          ▼              ▼
//!  placement   groups   acquire   readiness       deploy
//!  (zones)    (ingress) (run/spot)  (poll)    (key, env, setup)
//!                 │        │          │              │
//!                 └────────┴────┬─────┘              │
//!                               ▼                    ▼
//!                      dyn CloudProvider       RemoteExecutor
//! ```
//!
//! # Components
//!
//! - **`placement`**: worker counts per availability zone
//! - **`groups`**: isolation groups, default ingress rules, teardown
//! - **`acquire`**: on-demand and spot acquisition, tagging
//! - **`readiness`**: polling instances into a target state
//! - **`locator`**: discovering cluster members by group
//! - **`deploy`**: handing a ready cluster to the deployment collaborator
//! - **`controller`**: the actions themselves

pub mod acquire;
pub mod controller;
pub mod deploy;
pub mod groups;
pub mod locator;
pub mod placement;
pub mod readiness;

pub use acquire::{InstanceAcquirer, block_devices};
pub use controller::{Action, ActionOutcome, LifecycleController, Prompt};
pub use deploy::{Deployer, DeploymentPlan, ShellDeployer};
pub use groups::SecurityGroupManager;
pub use locator::{ClusterLocator, ClusterMembers};
pub use placement::{partition, zone_placement};
pub use readiness::{ReadinessPoller, WaitTarget, cancelled, never_cancelled};
