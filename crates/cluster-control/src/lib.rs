//! Provisioning and day-two operations for a small EC2 cluster.
//!
//! A cluster is described by a [`ClusterTemplate`], brought up by the
//! [`Provisioner`], operated through the [`ServiceController`] and
//! [`SourceUpdater`], and released again by the [`Deprovisioner`]. Every
//! allocated identifier is recorded in a [`ClusterState`] that is persisted
//! after each mutation, so an interrupted `up` can always be cleaned up by
//! `down`.
//!
//! # Example
//!
//! ```rust,ignore
//! use cluster_control::{ClusterDir, ClusterTemplate, Provisioner};
//! use cluster_control::provider::aws::AwsCli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dir = ClusterDir::new(".cluster-control");
//!     let template = ClusterTemplate::load(&dir.template_file())?;
//!     let ec2 = AwsCli::new(&template.region);
//!
//!     let state = Provisioner::new(&ec2, &dir, &template).up().await?;
//!     println!("{} instances running", state.instances.len());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bootstrap;
pub mod deprovisioner;
pub mod error;
pub mod github;
pub mod provider;
pub mod provisioner;
pub mod remote;
pub mod report;
pub mod service;
pub mod source;
pub mod state;
pub mod template;
pub mod ui;

pub use bootstrap::Bootstrapper;
pub use deprovisioner::Deprovisioner;
pub use error::{Error, Result, TeardownFailure};
pub use provisioner::Provisioner;
pub use report::{BatchReport, InstanceOutcome};
pub use service::ServiceController;
pub use source::SourceUpdater;
pub use state::{ClusterDir, ClusterState, InstanceRecord, Phase, ServiceStatus};
pub use template::{ClusterTemplate, TemplateError};
