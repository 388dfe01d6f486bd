//! Pass-through plugins.
//!
//! The no-op caller emits an empty-sequence result per chunk and the no-op
//! aligner forwards results untouched. Together they strip basecalling and
//! alignment out of the pipeline for latency testing (`unblock-all`) and
//! plumbing tests.

use crate::error::Result;
use crate::model::{Chunk, ReadResult};
use crate::plugins::{Aligner, Caller, ResultStream};

pub struct NoOpCaller;

impl Caller for NoOpCaller {
    fn basecall<'a>(&'a mut self, chunks: &'a [Chunk]) -> Result<ResultStream<'a>> {
        Ok(Box::new(chunks.iter().map(|c| {
            ReadResult::empty(c.channel, c.read_number, c.read_id.clone())
        })))
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "no-op caller (all reads yield empty sequence)".into()
    }

    fn disconnect(&mut self) {}
}

pub struct NoOpAligner;

impl Aligner for NoOpAligner {
    fn align<'a>(&'a mut self, results: ResultStream<'a>) -> ResultStream<'a> {
        results
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn initialised(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "no-op aligner (results pass through unmapped)".into()
    }

    fn disconnect(&mut self) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
