//! Compute provider abstraction.
//!
//! The provisioner and deprovisioner only talk to the [`Ec2`] trait. The
//! [`aws`] module implements it on top of the `aws` command line tool.

pub mod aws;
mod traits;

pub use traits::*;
