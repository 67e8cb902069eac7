//! Transaction intake: a fixed worker pool fed by a bounded queue, plus a
//! side queue that rations contract-invoking transactions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::block::Hash;
use crate::chain::{ChainDelegate, ChainError};
use crate::config;
use crate::peer::PeerConnection;
use crate::transaction::Transaction;

struct TxJob {
    peer: Arc<PeerConnection>,
    tx: Transaction,
    queued_at: Instant,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Accepted { peer: Arc<PeerConnection>, tx: Transaction },
    Rejected { peer: Arc<PeerConnection>, tx_id: Hash, error: ChainError },
}

pub struct TransactionDispatcher {
    work_tx: mpsc::Sender<TxJob>,
    backlog: Arc<AtomicUsize>,
    contracts: Mutex<VecDeque<TxJob>>,
    max_queue: usize,
    contract_batch: usize,
    contract_ttl: Duration,
}

impl TransactionDispatcher {
    /// Spawn the workers and the contract drain loop. Outcomes of every
    /// applied transaction arrive on the returned receiver.
    pub fn start(
        cfg: &config::Dispatcher,
        chain: Arc<dyn ChainDelegate>,
        shutdown: &broadcast::Sender<()>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchOutcome>) {
        let (work_tx, work_rx) = mpsc::channel::<TxJob>(cfg.max_queue.max(1));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let backlog = Arc::new(AtomicUsize::new(0));

        for worker in 0..cfg.workers.max(1) {
            let work_rx = work_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let chain = chain.clone();
            let backlog = backlog.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        job = async { work_rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };
                    backlog.fetch_sub(1, Ordering::AcqRel);
                    if let Some(outcome) = handle(chain.as_ref(), job) {
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                }
                debug!(worker, "transaction worker stopped");
            });
        }

        let dispatcher = Arc::new(Self {
            work_tx,
            backlog,
            contracts: Mutex::new(VecDeque::new()),
            max_queue: cfg.max_queue,
            contract_batch: cfg.contract_batch,
            contract_ttl: Duration::from_millis(cfg.contract_ttl_ms),
        });

        let drainer = dispatcher.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let period = Duration::from_millis(cfg.contract_drain_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => drainer.drain_contracts(),
                }
            }
        });

        (dispatcher, outcome_rx)
    }

    /// Queue one transaction received from `peer`. False when it was dropped
    /// because the relevant queue is full.
    pub fn submit(&self, peer: &Arc<PeerConnection>, tx: Transaction) -> bool {
        let job = TxJob { peer: peer.clone(), tx, queued_at: Instant::now() };
        if job.tx.contract.invokes_vm() {
            let mut contracts = self.contracts.lock();
            if contracts.len() >= self.max_queue {
                warn!(queue = contracts.len(), peer = %peer.node_id(), "contract queue full, dropping transaction");
                return false;
            }
            contracts.push_back(job);
            return true;
        }
        self.enqueue(job)
    }

    fn enqueue(&self, job: TxJob) -> bool {
        self.backlog.fetch_add(1, Ordering::AcqRel);
        match self.work_tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
                warn!(error = %e, "transaction queue rejected job");
                false
            }
        }
    }

    /// Move contract transactions to the workers while their queue is short.
    pub fn drain_contracts(&self) {
        let mut contracts = self.contracts.lock();
        while self.backlog.load(Ordering::Acquire) < self.contract_batch {
            let Some(job) = contracts.pop_front() else { break };
            if job.queued_at.elapsed() > self.contract_ttl {
                debug!(tx = %hex::encode(&job.tx.id()[..8]), "contract transaction expired in queue");
                continue;
            }
            if !self.enqueue(job) {
                break;
            }
        }
    }

    pub fn worker_backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn contract_backlog(&self) -> usize {
        self.contracts.lock().len()
    }

    pub fn backlog(&self) -> usize {
        self.worker_backlog() + self.contract_backlog()
    }

    pub fn is_busy(&self) -> bool {
        self.backlog() > self.max_queue
    }
}

fn handle(chain: &dyn ChainDelegate, job: TxJob) -> Option<DispatchOutcome> {
    let TxJob { peer, tx, .. } = job;
    if peer.is_disconnected() {
        debug!(peer = %peer.node_id(), "dropping transaction from disconnected peer");
        return None;
    }
    match chain.apply_transaction(&tx) {
        Ok(true) => Some(DispatchOutcome::Accepted { peer, tx }),
        Ok(false) | Err(ChainError::DuplicateTransaction(_)) => None,
        Err(error) => Some(DispatchOutcome::Rejected { peer, tx_id: tx.id(), error }),
    }
}
