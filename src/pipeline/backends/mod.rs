// Acquisition backends: native HTTP streaming and the extraction tool

pub mod extractor;
pub mod http;

pub use extractor::ExtractorBackend;
pub use http::HttpStreamBackend;
