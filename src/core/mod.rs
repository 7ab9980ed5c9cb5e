pub mod autodiff;
pub mod chemistry;
pub mod domain;
pub mod fingerprint;
pub mod geometry;
