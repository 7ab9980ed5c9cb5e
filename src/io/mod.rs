pub mod artifact;
pub mod extxyz;
