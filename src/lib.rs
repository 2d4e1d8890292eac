pub mod producers;
pub mod readers;
