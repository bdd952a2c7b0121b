//! Background loops: dead-agent sweep, agent re-scan and backlog
//! processing.
//!
//! Each loop sleeps for its interval, does one pass, and stops when the
//! shared shutdown signal fires. A failed pass is logged and the loop
//! carries on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use svcvm_core::config::SchedulerConfig;
use svcvm_scheduler::SchedulingStack;

use crate::handler::RecoveryHandler;

/// How often each background loop runs.
#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    pub dead_agent_scan: Duration,
    pub agent_rescan: Duration,
    pub backlog: Duration,
}

impl LoopIntervals {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            dead_agent_scan: config.dead_agent_scan_interval(),
            agent_rescan: config.agent_rescan_interval(),
            backlog: config.backlog_processing_interval(),
        }
    }
}

/// Handles of the running loops.
pub struct BackgroundLoops {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BackgroundLoops {
    pub fn start(
        intervals: LoopIntervals,
        stack: Arc<SchedulingStack>,
        handler: Arc<RecoveryHandler>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(3);

        let h = handler.clone();
        handles.push(tokio::spawn(run_periodic(
            "dead_agent_scan",
            intervals.dead_agent_scan,
            shutdown_rx.clone(),
            move || {
                let h = h.clone();
                async move {
                    match h.scan_dead_agents().await {
                        Ok(reports) if !reports.is_empty() => {
                            info!(hosts = reports.len(), "dead config agents handled")
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dead agent scan failed"),
                    }
                }
            },
        )));

        let s = stack.clone();
        handles.push(tokio::spawn(run_periodic(
            "agent_rescan",
            intervals.agent_rescan,
            shutdown_rx.clone(),
            move || {
                let s = s.clone();
                async move {
                    match s.selector.rescan_unassigned().await {
                        Ok(0) => {}
                        Ok(n) => info!(assigned = n, "agent-less hosting devices assigned"),
                        Err(e) => error!(error = %e, "agent re-scan failed"),
                    }
                }
            },
        )));

        let s = stack;
        handles.push(tokio::spawn(run_periodic(
            "backlog",
            intervals.backlog,
            shutdown_rx,
            move || {
                let s = s.clone();
                async move {
                    if let Err(e) = s.scheduler.process_backlog().await {
                        error!(error = %e, "backlog processing failed");
                    }
                }
            },
        )));

        info!(
            dead_agent_scan = ?intervals.dead_agent_scan,
            agent_rescan = ?intervals.agent_rescan,
            backlog = ?intervals.backlog,
            "background loops started"
        );
        Self { handles, shutdown_tx }
    }

    /// Signal every loop and wait for it to finish its current pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background loop panicked");
            }
        }
        info!("background loops stopped");
    }
}

async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(%name, ?interval, "loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => pass().await,
            _ = shutdown.changed() => {
                debug!(%name, "loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loop_runs_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let (count_tx, mut count_rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = tokio::spawn(run_periodic("test", Duration::from_millis(5), rx, move || {
            let count_tx = count_tx.clone();
            async move {
                let _ = count_tx.send(());
            }
        }));

        count_rx.recv().await.unwrap();
        count_rx.recv().await.unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn intervals_follow_config() {
        let config = SchedulerConfig::default();
        let intervals = LoopIntervals::from_config(&config);
        assert_eq!(intervals.backlog, config.backlog_processing_interval());
        assert_eq!(intervals.agent_rescan, config.agent_rescan_interval());
        assert_eq!(intervals.dead_agent_scan, config.dead_agent_scan_interval());
    }
}
