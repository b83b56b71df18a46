//! Vela Core
//!
//! Core library for an infrastructure management tool that reconciles declared
//! resources against remote cloud APIs

pub mod differ;
pub mod flatmap;
pub mod lock;
pub mod provider;
pub mod resource;
pub mod schema;
