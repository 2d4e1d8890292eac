// src/producers/mod.rs
use futures::future::BoxFuture;
use std::io::Write;

pub mod error;
pub mod registry;
pub mod server;
pub mod spreadsheet;

pub use error::ProduceError;
pub use registry::{Registry, RegistryError};

/// A plugin for [`Registry`]: given a named source, a producer renders it
/// in a concrete output format.
pub trait Producer: Send + Sync {
    /// Writes `name` as a web page into `out`.
    fn html<'a>(
        &'a self,
        out: &'a mut (dyn Write + Send),
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), ProduceError>>;
}
