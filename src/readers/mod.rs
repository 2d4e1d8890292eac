// src/readers/mod.rs
pub mod date_parser;
pub mod delimited;
pub mod loader;
pub mod monospace;

pub use delimited::DelimitedReader;
pub use loader::{FsLoader, Loader, Source};
pub use monospace::MonospaceReader;
