//! AWS EC2 provider.
//!
//! Implements the [`Ec2`](super::Ec2) trait by running the `aws` CLI with
//! JSON output. Credentials and the default profile come from the usual AWS
//! configuration (`~/.aws`, `AWS_PROFILE`, environment variables).

mod client;
mod models;

pub use client::AwsCli;
