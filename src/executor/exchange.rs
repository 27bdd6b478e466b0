//! The exchange node: repository-partitioned parallel execution.
//!
//! The child plan is executed once per partition of the pool's repositories,
//! each on its own worker thread with a context restricted to its subset.
//! Workers push rows into a bounded channel; the merge iterator drains it in
//! arrival order. Partition merge order is unspecified; a plan that needs a
//! total order places Sort above the exchange.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};

use crate::planner::Plan;
use crate::session::Context;
use crate::sql::Row;

use super::error::{ExecuteError, ExecuteResult};
use super::iter::RowIter;
use super::operators::build_iter;

const CHANNEL_CAPACITY: usize = 1024;

pub fn exchange_iter(ctx: &Context, width: usize, child: &Plan) -> ExecuteResult<Box<dyn RowIter>> {
    let repos = ctx.repo_ids();
    let workers = width.max(1).min(repos.len().max(1));

    // One repository (or none): nothing to partition.
    if workers <= 1 {
        return build_iter(child, ctx);
    }

    // Round-robin the repositories over the workers.
    let mut partitions: Vec<Vec<String>> = vec![Vec::new(); workers];
    for (i, repo) in repos.into_iter().enumerate() {
        partitions[i % workers].push(repo);
    }

    let (tx, rx) = bounded::<ExecuteResult<Row>>(CHANNEL_CAPACITY);
    let mut handles = Vec::with_capacity(workers);

    for partition in partitions {
        let worker_ctx = ctx.with_repo_subset(partition);
        let worker_plan = child.clone();
        let worker_tx = tx.clone();
        let handle = std::thread::spawn(move || {
            let result = (|| -> ExecuteResult<()> {
                let mut iter = build_iter(&worker_plan, &worker_ctx)?;
                loop {
                    worker_ctx.check()?;
                    match iter.next_row()? {
                        Some(row) => {
                            // The merge side hung up: stop quietly.
                            if worker_tx.send(Ok(row)).is_err() {
                                return Ok(());
                            }
                        }
                        None => return iter.close(),
                    }
                }
            })();
            if let Err(e) = result {
                let _ = worker_tx.send(Err(e));
            }
        });
        handles.push(handle);
    }
    drop(tx);

    Ok(Box::new(ExchangeIter {
        ctx: ctx.clone(),
        rx: Some(rx),
        handles,
        failed: false,
    }))
}

struct ExchangeIter {
    ctx: Context,
    rx: Option<Receiver<ExecuteResult<Row>>>,
    handles: Vec<JoinHandle<()>>,
    failed: bool,
}

impl ExchangeIter {
    fn join_workers(&mut self) {
        self.rx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl RowIter for ExchangeIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.failed {
            return Err(ExecuteError::Internal("exchange used after error".into()));
        }
        self.ctx.check()?;
        let rx = match &self.rx {
            Some(rx) => rx,
            None => return Ok(None),
        };
        match rx.recv() {
            Ok(Ok(row)) => Ok(Some(row)),
            Ok(Err(e)) => {
                self.failed = true;
                self.join_workers();
                Err(e)
            }
            // All workers finished and dropped their senders.
            Err(_) => {
                self.join_workers();
                Ok(None)
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        // Dropping the receiver makes every worker's next send fail, which
        // ends them promptly.
        self.join_workers();
        Ok(())
    }
}

impl Drop for ExchangeIter {
    fn drop(&mut self) {
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Table;
    use crate::planner::TableNode;
    use crate::sql::Value;
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc;

    fn three_repo_ctx() -> (Vec<FixtureRepo>, Context) {
        let fixtures = vec![
            FixtureRepo::with_history(&["a1", "a2"]),
            FixtureRepo::with_history(&["b1"]),
            FixtureRepo::with_history(&["c1", "c2", "c3"]),
        ];
        let pool = Arc::new(RepositoryPool::default());
        for f in &fixtures {
            pool.add_repository(f.path()).unwrap();
        }
        (fixtures, Context::for_pool(pool))
    }

    #[test]
    fn test_exchange_matches_serial_scan() {
        let (_fixtures, ctx) = three_repo_ctx();
        let scan = Plan::Table(TableNode::new(Table::Commits, None));

        let mut serial = crate::executor::operators::run_to_rows(&scan, &ctx).unwrap();
        let exchange = Plan::Exchange {
            width: 2,
            child: Box::new(scan),
        };
        let mut parallel = crate::executor::operators::run_to_rows(&exchange, &ctx).unwrap();

        // Partition merge order is arbitrary; compare as multisets.
        let key = |r: &Row| Value::encode_tuple(r);
        serial.sort_by_key(key);
        parallel.sort_by_key(key);
        assert_eq!(serial, parallel);
        assert_eq!(serial.len(), 6);
    }

    #[test]
    fn test_exchange_single_repo_falls_through() {
        let fixture = FixtureRepo::with_history(&["one"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let exchange = Plan::Exchange {
            width: 8,
            child: Box::new(Plan::Table(TableNode::new(Table::Commits, None))),
        };
        let rows = crate::executor::operators::run_to_rows(&exchange, &ctx).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_exchange_cancellation() {
        let (_fixtures, ctx) = three_repo_ctx();
        let exchange = Plan::Exchange {
            width: 2,
            child: Box::new(Plan::Table(TableNode::new(Table::Commits, None))),
        };
        let mut iter = build_iter(&exchange, &ctx).unwrap();
        ctx.cancel_token().cancel();
        // The merge surfaces cancellation on the next pull.
        let mut saw_cancelled = false;
        for _ in 0..10 {
            match iter.next_row() {
                Err(ExecuteError::Cancelled) => {
                    saw_cancelled = true;
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => break,
            }
        }
        assert!(saw_cancelled);
        iter.close().unwrap();
    }
}
