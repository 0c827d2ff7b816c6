//! # convq worker
//!
//! The handler that performs file conversions for the queue: moves uploads
//! through the staging directories, runs the configured converter under a
//! deadline and quarantines inputs of failed attempts.

pub mod config;
pub mod converter;
pub mod error;
pub mod processor;
pub mod staging;

pub use config::WorkerConfig;
pub use converter::{
    CommandConverter, ConversionError, ConversionResult, Converter, ConverterRegistry,
    FnConverter, Route, MPP_TO_XML,
};
pub use error::ProcessError;
pub use processor::{ConversionOutcome, ConversionPayload, ConversionProcessor};
pub use staging::StagingArea;
