//! Readers that turn single-cell datasets into per-modality matrices and
//! annotation tables.
//!
//! Supported inputs are 10X HDF5 feature-barcode matrices, AnnData H5AD
//! files, Matrix Market triplets, SummarizedExperiment objects in RDS
//! files, and ArtifactDB or alabaster projects packed in ZIP archives.
//! Native HDF5, RDS and matrix libraries are reached through the engine
//! traits in [`h5`], [`rds`] and [`matrix`]; [`engine`] bundles them and
//! ships in-memory reference implementations.

pub mod archive;
pub mod assay;
pub mod config;
pub mod dataset;
pub mod delayed;
pub mod domain;
pub mod engine;
pub mod error;
pub mod features;
pub mod file_ref;
pub mod frame;
pub mod frame_loader;
pub mod h5;
pub mod lifecycle;
pub mod matrix;
pub mod navigator;
pub mod output;
pub mod project;
pub mod rds;
pub mod registry;
pub mod serialize;
pub mod text;
