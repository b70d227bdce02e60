//! Command-line front end: PDF rendering, settings and card export around the
//! `card-flow` pipeline.

pub mod export;
pub mod render;
pub mod settings;
