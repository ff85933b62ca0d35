// src/lib.rs

pub mod backup;
pub mod batch;
pub mod config;
pub mod driver;
pub mod identity;
pub mod orchestrator;
pub mod project;
pub mod scanner;
pub mod stats;
