//! Module runtime: long-lived tasks driven by bus subscriptions.
//!
//! Every module is one tokio task. The runner merges the module's
//! subscriptions into a single dispatch loop, so `on_iu` is never entered
//! concurrently and per-topic order is preserved. Modules that need
//! time-driven or task-driven wakeups (watchdogs, streaming generations)
//! send themselves typed events through the context's event sender; those
//! are dispatched through `on_event` on the same loop.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::error::Result;

/// A unit tagged with the topic it arrived on.
#[derive(Debug, Clone)]
pub struct TopicIu {
    pub topic: &'static str,
    pub iu: crate::iu::IncrementalUnit,
}

/// Per-module runtime context handed to every hook.
pub struct ModuleContext<E> {
    bus: MessageBus,
    events: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
}

impl<E> ModuleContext<E> {
    /// Build a context for driving a module by hand, without the runner
    /// (embedding, tests). The caller owns the event receiver and feeds
    /// `on_event` itself.
    pub fn new(bus: MessageBus, events: mpsc::UnboundedSender<E>, cancel: CancellationToken) -> Self {
        Self { bus, events, cancel }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Sender for the module's own event type. Cloneable into spawned tasks
    /// (timers, streaming generations); events are dispatched sequentially
    /// with bus input.
    pub fn events(&self) -> mpsc::UnboundedSender<E> {
        self.events.clone()
    }

    /// Cancellation token scoped to this module's lifetime.
    pub fn cancel(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A long-lived incremental module.
#[async_trait]
pub trait IncrementalModule: Send + 'static {
    /// Typed internal events delivered through `on_event`. Use `()` for
    /// modules driven purely by bus input.
    type Event: Send + 'static;

    /// Stable module name, used as the IU producer field and in logs.
    fn name(&self) -> &'static str;

    /// Topics this module consumes.
    fn subscriptions(&self) -> &'static [&'static str];

    async fn on_start(&mut self, _ctx: &ModuleContext<Self::Event>) -> Result<()> {
        Ok(())
    }

    /// Handle one unit. Called sequentially; never concurrently with itself
    /// or with `on_event`.
    async fn on_iu(&mut self, iu: TopicIu, ctx: &ModuleContext<Self::Event>) -> Result<()>;

    /// Handle one internal event.
    async fn on_event(&mut self, _event: Self::Event, _ctx: &ModuleContext<Self::Event>) -> Result<()> {
        Ok(())
    }

    async fn on_shutdown(&mut self, _ctx: &ModuleContext<Self::Event>) -> Result<()> {
        Ok(())
    }
}

/// Handle to a spawned module.
pub struct ModuleHandle {
    pub name: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ModuleHandle {
    /// Request shutdown; the module drains briefly, then stops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the module task to finish.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(module = self.name, "module task panicked: {e}");
        }
    }
}

/// Spawns modules and owns their shutdown ordering.
pub struct ModuleRunner {
    bus: MessageBus,
    cancel: CancellationToken,
    shutdown_drain: Duration,
}

impl ModuleRunner {
    pub fn new(bus: MessageBus, cancel: CancellationToken, shutdown_drain: Duration) -> Self {
        Self {
            bus,
            cancel,
            shutdown_drain,
        }
    }

    /// Spawn one module as a task. Input dispatch is sequential; shutdown
    /// drains pending input for up to the configured bound, then calls
    /// `on_shutdown` and releases the subscriptions.
    pub fn spawn<M: IncrementalModule>(&self, mut module: M) -> ModuleHandle {
        let name = module.name();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        let drain = self.shutdown_drain;

        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::unbounded_channel::<M::Event>();
            let ctx = ModuleContext {
                bus: bus.clone(),
                events: event_tx,
                cancel: task_cancel.clone(),
            };

            // Merge all subscriptions into one ordered input channel. One
            // forwarder per topic keeps per-topic order intact.
            let (input_tx, mut input_rx) = mpsc::channel::<TopicIu>(32);
            let mut forwarders = Vec::new();
            for &topic in module.subscriptions() {
                let mut sub = bus.subscribe(topic);
                let tx = input_tx.clone();
                forwarders.push(tokio::spawn(async move {
                    while let Some(iu) = sub.recv().await {
                        if tx.send(TopicIu { topic, iu }).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            drop(input_tx);

            if let Err(e) = module.on_start(&ctx).await {
                warn!(module = name, "on_start failed: {e}");
                task_cancel.cancel();
            } else {
                info!(module = name, "module started");
            }

            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    iu = input_rx.recv() => match iu {
                        Some(iu) => {
                            if let Err(e) = module.on_iu(iu, &ctx).await {
                                warn!(module = name, "on_iu failed: {e}");
                            }
                        }
                        None => break,
                    },
                    ev = event_rx.recv() => match ev {
                        Some(ev) => {
                            if let Err(e) = module.on_event(ev, &ctx).await {
                                warn!(module = name, "on_event failed: {e}");
                            }
                        }
                        // The module holds a sender via ctx, so this arm is
                        // unreachable until the task ends.
                        None => break,
                    },
                }
            }

            // Bounded drain: finish what is already queued, then stop.
            let deadline = tokio::time::Instant::now() + drain;
            loop {
                match tokio::time::timeout_at(deadline, input_rx.recv()).await {
                    Ok(Some(iu)) => {
                        if let Err(e) = module.on_iu(iu, &ctx).await {
                            warn!(module = name, "on_iu failed during drain: {e}");
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        debug!(module = name, "drain deadline reached");
                        break;
                    }
                }
            }

            for f in forwarders {
                f.abort();
            }
            if let Err(e) = module.on_shutdown(&ctx).await {
                warn!(module = name, "on_shutdown failed: {e}");
            }
            info!(module = name, "module stopped");
        });

        ModuleHandle { name, cancel, join }
    }
}
