//! HTTP serving layer for portlens.

pub mod companies;
pub mod rest;
