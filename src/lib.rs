//! Energy and force calculator for anisotropic (ellipsoidal) particles.
//!
//! A [`Calculator`] turns a [`Configuration`] into a descriptor vector, maps it to an
//! energy through an [`EnergyModel`] and, on request, derives forces either by central
//! finite differences or by one reverse-mode pass over a gradient tape.

pub mod core;
pub mod engine;
pub mod error;
pub mod io;

pub use crate::core::domain::Configuration;
pub use crate::core::fingerprint::Fingerprint;
pub use crate::engine::calculator::{Backend, Calculator, Property, Results};
pub use crate::engine::config::{BackendKind, CalculatorConfig, RunConfig};
pub use crate::engine::model::EnergyModel;
pub use crate::error::CalcError;
