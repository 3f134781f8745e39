//! Depth-first traversal of the archive folder tree.
//!
//! A folder's subfolders are visited, in listing order, before its own
//! messages are drained. Messages accumulate in the traversal context and
//! are handed to the dispatcher each time the batch is full, and once more
//! when the folder runs out of messages.

use futures::future::LocalBoxFuture;
use tracing::{debug, info};

use crate::archive::ArchiveFolder;
use crate::dispatch::{BatchReport, Dispatcher};
use crate::error::Result;

/// Totals of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub folders: usize,
    pub messages: usize,
    pub batches: usize,
    pub delivered: usize,
    pub failed: usize,
    pub duplicates: usize,
}

impl MigrationReport {
    fn absorb(&mut self, batch: BatchReport) {
        self.batches += 1;
        self.delivered += batch.delivered;
        self.failed += batch.failed;
        self.duplicates += batch.duplicates;
    }
}

/// State carried down the recursion.
struct TraversalContext<M> {
    batch: Vec<M>,
    depth: usize,
    report: MigrationReport,
}

pub struct Walker<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> Walker<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Migrate every message below `root`.
    ///
    /// Stops at the first classification or archive error.
    pub async fn run<F: ArchiveFolder>(&self, root: F) -> Result<MigrationReport> {
        let mut ctx = TraversalContext {
            batch: Vec::with_capacity(self.dispatcher.config().insert_size),
            depth: 0,
            report: MigrationReport::default(),
        };
        self.visit(root, &mut ctx).await?;
        Ok(ctx.report)
    }

    fn visit<'b, F>(
        &'b self,
        mut folder: F,
        ctx: &'b mut TraversalContext<F::Message>,
    ) -> LocalBoxFuture<'b, Result<()>>
    where
        F: ArchiveFolder + 'b,
    {
        Box::pin(async move {
            ctx.depth += 1;
            ctx.report.folders += 1;
            // The root folder has no display name.
            if ctx.depth > 1 {
                info!(folder = folder.display_name(), depth = ctx.depth - 1, "Entering folder");
            }

            for child in folder.subfolders()? {
                self.visit(child, ctx).await?;
            }

            let insert_size = self.dispatcher.config().insert_size.max(1);
            while let Some(message) = folder.next_message()? {
                ctx.report.messages += 1;
                ctx.batch.push(message);
                if ctx.batch.len() == insert_size {
                    let report = self.dispatcher.flush(&mut ctx.batch).await?;
                    ctx.report.absorb(report);
                }
            }

            if !ctx.batch.is_empty() {
                let report = self.dispatcher.flush(&mut ctx.batch).await?;
                ctx.report.absorb(report);
            }

            debug!(folder = folder.display_name(), "Folder done");
            ctx.depth -= 1;
            Ok(())
        })
    }
}
