//! Cloud image discovery and KVM server provisioning.
//!
//! [`catalog`] probes distribution mirrors for cloud images, [`registry`]
//! maps logical image names to local copies, and [`provision`] turns a
//! request into a running instance through a [`driver::Driver`].

pub mod catalog;
pub mod config;
pub mod driver;
pub mod helpers;
pub mod notify;
pub mod provision;
pub mod registry;
pub mod repositories;
pub mod server;

#[cfg(test)]
mod test_support;
