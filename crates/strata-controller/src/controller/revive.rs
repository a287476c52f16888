use std::sync::Arc;

use log::{error, info, warn};
use strata_server::actor::{ActorAction, ActorContext};
use tokio::sync::oneshot;

use crate::controller::{ControllerActor, ControllerEvent, OperationPlan};
use crate::error::ControllerResult;
use crate::lifecycle::AbortReason;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::snapshot::{ControllerSnapshot, SNAPSHOT_VERSION};

impl ControllerActor {
    pub(super) fn handle_snapshot_downloaded(
        &mut self,
        ctx: &mut ActorContext<Self>,
        plan: OperationPlan,
        data: ControllerResult<Option<Vec<u8>>>,
        result: oneshot::Sender<ControllerResult<()>>,
    ) -> ActorAction {
        let data = match data {
            Ok(Some(x)) => x,
            Ok(None) => {
                info!("no snapshot is stored, starting clean");
                return self.start_clean(ctx, plan, result);
            }
            Err(e) => {
                warn!("failed to download snapshot, starting clean: {e}");
                return self.start_clean(ctx, plan, result);
            }
        };
        let snapshot = match ControllerSnapshot::decode(&data) {
            Ok(x) => x,
            Err(e) => {
                warn!("failed to load snapshot, starting clean: {e}");
                return self.start_clean(ctx, plan, result);
            }
        };
        let host = Arc::clone(&self.options().host);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let alive = host
                .check_transactions(snapshot.transactions.clone())
                .await;
            let event = ControllerEvent::RevivalValidated {
                plan,
                snapshot: Box::new(snapshot),
                alive,
                result,
            };
            if let Err(e) = handle.send(event).await {
                error!("failed to deliver revival validation: {e}");
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_revival_validated(
        &mut self,
        ctx: &mut ActorContext<Self>,
        plan: OperationPlan,
        snapshot: ControllerSnapshot,
        alive: ControllerResult<bool>,
        result: oneshot::Sender<ControllerResult<()>>,
    ) -> ActorAction {
        match alive {
            Ok(true) => {}
            Ok(false) => {
                info!("transactions of the snapshot are gone, starting clean");
                return self.start_clean(ctx, plan, result);
            }
            Err(e) => {
                warn!("failed to check transactions of the snapshot, starting clean: {e}");
                return self.start_clean(ctx, plan, result);
            }
        }
        self.revive(ctx, snapshot);
        let _ = result.send(Ok(()));
        ActorAction::Continue
    }

    /// Restores every subsystem from the snapshot and resumes scheduling.
    fn revive(&mut self, ctx: &mut ActorContext<Self>, snapshot: ControllerSnapshot) {
        let joblet_count = snapshot.lifecycle.joblets.len();
        self.transactions = snapshot.transactions;
        self.tasks = snapshot.tasks;
        self.scheduler = Scheduler::new(SchedulerOptions::from(self.options()), &self.tasks);
        self.scheduler.restore(snapshot.scheduler);
        self.chunk_tracker.restore(snapshot.chunk_tracker);
        self.lifecycle.restore(snapshot.lifecycle);
        self.snapshots.restore(snapshot.queues);
        info!(
            "revived operation with {} tasks and {joblet_count} joblets",
            self.tasks.len()
        );
        self.activate(ctx);
        if !self.snapshots.options().enable_job_revival && joblet_count > 0 {
            info!("aborting {joblet_count} revived joblets since job revival is disabled");
            self.abort_all_joblets(AbortReason::Scheduler);
        }
    }

    pub(super) fn build_snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            version: SNAPSHOT_VERSION,
            transactions: self.transactions.clone(),
            tasks: self.tasks.clone(),
            chunk_tracker: self.chunk_tracker.snapshot(),
            scheduler: self.scheduler.snapshot(),
            lifecycle: self.lifecycle.snapshot(),
            queues: self.snapshots.queues().clone(),
        }
    }
}
