//! Scheduler: the main hourly cycle plus every supervisory loop, each on its
//! own cadence, all serialized through the execution-lock registry's global
//! lock so at most one of them ever mutates state at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lock_registry::ExecutionLockRegistry;
use crate::orchestrator::Orchestrator;

/// Gates the main hourly cycle: supervisory loops still run while it is
/// true, but skip any destructive action against a symbol the main cycle
/// might be mid-placement on (enforced by the symbol lock, not this flag).
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ExecutionLockRegistry>,
    is_running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, registry: Arc<ExecutionLockRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns every supervisory loop and the main cycle; returns their join
    /// handles so the caller can await a clean shutdown.
    pub fn spawn_all(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(self.spawn_main_cycle());
        handles.push(self.spawn_loop("reconciler-phase-a", Duration::from_secs(45), {
            let orchestrator = Arc::clone(&self.orchestrator);
            move |thread_id| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(err) = orchestrator.reconciler.reconcile_phase_a().await {
                        tracing::warn!(error = %err, "reconciler phase A failed");
                    }
                    let _ = thread_id;
                }
            }
        }));
        handles.push(self.spawn_loop("reconciler-phase-b", Duration::from_secs(60), {
            let orchestrator = Arc::clone(&self.orchestrator);
            move |thread_id| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(err) = orchestrator.reconciler.reconcile_phase_b(&thread_id).await {
                        tracing::warn!(error = %err, "reconciler phase B failed");
                    }
                }
            }
        }));
        handles.push(self.spawn_loop("guardian", Duration::from_secs(30), {
            let orchestrator = Arc::clone(&self.orchestrator);
            move |thread_id| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(err) = orchestrator.guardian.run_once(&thread_id).await {
                        tracing::warn!(error = %err, "guardian tick failed");
                    }
                }
            }
        }));
        handles.push(self.spawn_loop("profit-take", Duration::from_secs(30), {
            let orchestrator = Arc::clone(&self.orchestrator);
            move |thread_id| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(err) = orchestrator.reconciler.take_profits(&thread_id).await {
                        tracing::warn!(error = %err, "profit-take tick failed");
                    }
                }
            }
        }));
        handles.push(self.spawn_loop("spread-flip", Duration::from_secs(60), {
            let orchestrator = Arc::clone(&self.orchestrator);
            move |thread_id| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    let basis_by_symbol = std::collections::HashMap::new();
                    if let Err(err) = orchestrator.reconciler.check_spread_flips(&basis_by_symbol, &thread_id).await {
                        tracing::warn!(error = %err, "spread-flip tick failed");
                    }
                }
            }
        }));

        handles
    }

    fn spawn_main_cycle(&self) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.registry);
        let is_running = Arc::clone(&self.is_running);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if is_running.swap(true, Ordering::SeqCst) {
                    debug!("main cycle already running, skipping tick");
                    continue;
                }
                let thread_id = uuid::Uuid::new_v4().to_string();
                if let Some(_guard) = registry.try_acquire_global_lock(&thread_id, "main-cycle") {
                    if let Err(err) = orchestrator.run_main_cycle(&thread_id).await {
                        tracing::error!(error = %err, "main cycle failed");
                    }
                } else {
                    debug!("main cycle could not acquire global lock, skipping tick");
                }
                is_running.store(false, Ordering::SeqCst);
            }
        })
    }

    /// Generic supervisory loop: fires every `period`, skips the tick if
    /// `is_running` (main cycle active) or the global lock is held, then
    /// runs `body` under a freshly acquired global lock released via RAII
    /// on drop.
    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, body: F) -> JoinHandle<()>
    where
        F: Fn(String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let is_running = Arc::clone(&self.is_running);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if is_running.load(Ordering::SeqCst) || registry.is_global_lock_held() {
                    continue;
                }
                let thread_id = uuid::Uuid::new_v4().to_string();
                let Some(_guard) = registry.try_acquire_global_lock(&thread_id, name) else {
                    continue;
                };
                info!(loop_name = name, thread_id, "supervisory loop tick");
                body(thread_id).await;
            }
        })
    }
}
