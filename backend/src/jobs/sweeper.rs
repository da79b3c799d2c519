// Expiry Sweeper - reclaims executions that waited past their deadline
//
// Runs periodically (and on demand through the operational endpoint). Every
// expiry goes through the pending store's atomic take, the same operation a
// resume uses, so a reply racing the sweep settles in exactly one outcome:
// either the execution resumes or it expires, never both.

use std::sync::Arc;

use crate::automations::{ExecutionEngine, SweepReport};

pub struct ExpirySweeperJob {
    engine: Arc<ExecutionEngine>,
}

impl ExpirySweeperJob {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(&self) -> SweepReport {
        self.engine.sweep_expired(None).await
    }
}
