pub mod calculator;
pub mod config;
pub mod descriptor;
pub mod forces;
pub mod model;
