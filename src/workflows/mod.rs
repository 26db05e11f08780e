//! Workflow definitions built on the orchestration engine.

pub mod pet_identification;
