//! Shared building blocks for the document-processing backend: configuration,
//! the failure taxonomy, queue and object-store adapters, and the GX client.

pub mod config;
pub mod db;
pub mod dto;
pub mod error;
pub mod gx;
pub mod queue;
pub mod storage;
