//! Source collaborators: anything that can hand the engine raw payload bytes.
//! A read distinguishes "here is a batch" from "nothing arrived within the
//! timeout" (which drives watermark advancement) and from "the stream ended".

use bytes::Bytes;

use crate::Result;

/// Kafka consumer as a source.
pub(crate) mod kafka;

/// Builtin synthetic source for load testing and end-to-end runs without a
/// broker.
pub(crate) mod generator;

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One batch of raw payloads, possibly short.
    Batch(Vec<Bytes>),
    /// No payload arrived within the read timeout.
    Idle,
    /// The stream is exhausted.
    Eof,
}

/// Set of Read related items that has to be implemented to become a Source.
#[trait_variant::make(SourceReader: Send)]
#[allow(dead_code)]
pub trait LocalSourceReader {
    /// Name of the source.
    fn name(&self) -> &'static str;

    /// Reads the next batch, waiting at most the source's configured timeout.
    async fn read(&mut self) -> Result<ReadOutcome>;

    /// Number of payloads yet to be read, if the source can tell.
    async fn pending(&mut self) -> Result<Option<usize>>;
}
