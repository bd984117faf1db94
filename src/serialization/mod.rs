//! Helpers for (de)serialising trained models and vocabularies.

pub mod model;

pub use model::ModelData;
