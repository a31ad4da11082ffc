use std::sync::Arc;

use lyra_bufpool::Pool;
use lyra_loader::LoadResult;
use lyra_platform::Mutex;
use lyra_sample::{Format, SampleFlags, SampleQueue};

use crate::{
    data_source::ReadOutcome,
    extractor::{ExtractorInput, TrackOutput, unexpected_end},
};

/// Largest chunk staged per `sample_data` call.
const MAX_STAGED_BYTES: usize = 64 * 1024;

/// Feeds one shared [`SampleQueue`].
///
/// Sample bytes are read into a pooled scratch buffer first, so the queue
/// lock is never held across a blocking read.
pub(crate) struct SampleQueueOutput {
    queue: Arc<Mutex<SampleQueue>>,
    scratch: Pool<Vec<u8>>,
}

impl SampleQueueOutput {
    pub(crate) fn new(queue: Arc<Mutex<SampleQueue>>, scratch: Pool<Vec<u8>>) -> Self {
        Self { queue, scratch }
    }
}

impl TrackOutput for SampleQueueOutput {
    fn format(&self, format: Format) {
        self.queue.lock().format(format);
    }

    fn sample_data(
        &self,
        input: &mut ExtractorInput<'_>,
        length: usize,
        allow_end_of_input: bool,
    ) -> LoadResult<ReadOutcome> {
        let want = length.min(MAX_STAGED_BYTES);
        let mut buf = self.scratch.acquire_with(|buf| buf.resize(want, 0));
        match input.read(&mut buf[..want])? {
            ReadOutcome::Read(count) => {
                self.queue.lock().sample_data(&buf[..count]);
                Ok(ReadOutcome::Read(count))
            }
            ReadOutcome::EndOfInput if allow_end_of_input => Ok(ReadOutcome::EndOfInput),
            ReadOutcome::EndOfInput => Err(unexpected_end(input.position())),
        }
    }

    fn sample_bytes(&self, data: &[u8]) {
        self.queue.lock().sample_data(data);
    }

    fn sample_metadata(&self, time_us: i64, flags: SampleFlags, size: usize, offset: usize) {
        self.queue.lock().sample_metadata(time_us, flags, size, offset);
    }
}
