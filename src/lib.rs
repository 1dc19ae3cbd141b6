//! Local, randomly addressable access to the MIT-Adobe FiveK dataset.
//!
//! The pieces fit together in one direction: [`camera`] identifies raw
//! captures, [`index`] joins annotations into per-split records,
//! [`acquire`] places the requested files under a [`store::Layout`], and
//! [`dataset`] serves items by position.

pub mod acquire;
pub mod camera;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod index;
pub mod output;
pub mod remote;
pub mod store;
