//! Coding session: binds a thread, an oracle, and a strategy to the
//! [`ChunkScheduler`].

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::CodingError;
use crate::models::{CodedThread, DataItem};
use crate::oracle::Oracle;
use crate::registry::{install_codes, prune_thread_codes};
use crate::scheduler::{Chunk, ChunkScheduler, ChunkSize, ChunkVisitor, ScheduleReport};
use crate::strategy::{normalize_lines, ChunkContext, CodingStrategy, ParsedResponse};

/// Called with the thread after every completed pass.
pub type Checkpoint<'a> = Box<dyn FnMut(&CodedThread) -> anyhow::Result<()> + Send + 'a>;

/// Scheduler settings for one coding run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub chunk_size: usize,
    pub retry_budget: usize,
    pub temperature: f32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 32,
            retry_budget: 4,
            temperature: 0.0,
        }
    }
}

/// [`ChunkVisitor`] that codes the items of one thread.
pub struct CodingSession<'a> {
    thread: &'a mut CodedThread,
    oracle: &'a dyn Oracle,
    strategy: &'a dyn CodingStrategy,
    temperature: f32,
    /// Passes below this index were completed by a prior run.
    resume_from: usize,
    checkpoint: Option<Checkpoint<'a>>,
}

impl<'a> CodingSession<'a> {
    pub fn new(
        thread: &'a mut CodedThread,
        oracle: &'a dyn Oracle,
        strategy: &'a dyn CodingStrategy,
        temperature: f32,
    ) -> Self {
        let resume_from = thread.iteration;
        Self {
            thread,
            oracle,
            strategy,
            temperature,
            resume_from,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint<'a>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn thread(&self) -> &CodedThread {
        &*self.thread
    }
}

#[async_trait]
impl<'a> ChunkVisitor<DataItem> for CodingSession<'a> {
    async fn preprocess(&mut self, items: Vec<DataItem>, iteration: usize) -> Result<Vec<DataItem>, CodingError> {
        if iteration < self.resume_from {
            debug!(thread = %self.thread.id, iteration, "pass already completed, skipping");
            return Ok(Vec::new());
        }
        Ok(self.strategy.preprocess(&*self.thread, items, iteration))
    }

    fn filter(&self, item: &DataItem, iteration: usize) -> bool {
        self.strategy.filter(item, iteration)
    }

    fn chunk_size(&self, recommended: usize, remaining: usize, iteration: usize, tries: usize) -> ChunkSize {
        self.strategy.chunk_size(recommended, remaining, iteration, tries)
    }

    async fn action(&mut self, chunk: Chunk<'_, DataItem>) -> Result<isize, CodingError> {
        let ctx = ChunkContext {
            items: chunk.items,
            chunk_start: chunk.chunk_start,
            size: chunk.size,
            iteration: chunk.iteration,
            tries: chunk.tries,
            is_first: chunk.is_first,
        };
        let prompts = self.strategy.build_prompts(&*self.thread, &ctx)?;
        debug!(
            thread = %self.thread.id,
            cursor = chunk.cursor,
            size = chunk.size,
            system_len = prompts.system.len(),
            user_len = prompts.user.len(),
            "asking oracle"
        );

        let temperature = self.strategy.temperature(self.temperature, chunk.tries);
        let response = self.oracle.ask(&prompts.system, &prompts.user, temperature).await?;
        debug!(thread = %self.thread.id, response_len = response.len(), "oracle answered");

        let lines = normalize_lines(&response);
        match self.strategy.parse_response(&mut *self.thread, &lines, &ctx)? {
            ParsedResponse::Codes(codes) => {
                let written = install_codes(&mut *self.thread, chunk.items, chunk.chunk_start, &codes);
                info!(thread = %self.thread.id, cursor = chunk.cursor, items = written, "chunk coded");
                Ok(0)
            }
            ParsedResponse::Shift(delta) => {
                info!(thread = %self.thread.id, cursor = chunk.cursor, delta, "chunk partially coded");
                Ok(delta)
            }
        }
    }

    async fn on_iterate(&mut self, iteration: usize) -> Result<(), CodingError> {
        prune_thread_codes(&mut *self.thread);
        self.thread.iteration = self.thread.iteration.max(iteration + 1);
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint(&*self.thread).map_err(|e| CodingError::Checkpoint(format!("{:#}", e)))?;
        }
        Ok(())
    }
}

/// Code every item of `thread` with `strategy`.
///
/// Threads carried over from a prior analysis resume after the last pass
/// they completed.
pub async fn code_thread<'a>(
    thread: &'a mut CodedThread,
    items: &[DataItem],
    oracle: &'a dyn Oracle,
    strategy: &'a dyn CodingStrategy,
    options: &SessionOptions,
    checkpoint: Option<Checkpoint<'a>>,
) -> Result<ScheduleReport, CodingError> {
    if options.chunk_size == 0 {
        return Err(CodingError::config("chunk size must be greater than zero"));
    }
    let scheduler = ChunkScheduler::new(options.chunk_size, options.retry_budget, strategy.iterations());
    let mut session = CodingSession::new(thread, oracle, strategy, options.temperature);
    if let Some(checkpoint) = checkpoint {
        session = session.with_checkpoint(checkpoint);
    }
    scheduler.run(items, &mut session).await
}
