//! Auto-tunnel service
//!
//! Attaching the service connects the decision arbiter to the network
//! stream and feeds its decisions into the lifecycle controller. Detaching
//! cancels both tasks; tunnels are left as they are.

use crate::network::NetworkState;
use crate::tunnel::arbiter::DecisionArbiter;
use crate::tunnel::controller::LifecycleController;
use crate::tunnel::events::Decision;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DECISION_QUEUE: usize = 8;

pub struct AutoTunnelService {
    arbiter: DecisionArbiter,
    controller: Arc<LifecycleController>,
    network: watch::Receiver<Option<NetworkState>>,
    parent: CancellationToken,
    attached: Mutex<Option<CancellationToken>>,
}

impl AutoTunnelService {
    pub fn new(
        arbiter: DecisionArbiter,
        controller: Arc<LifecycleController>,
        network: watch::Receiver<Option<NetworkState>>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            arbiter,
            controller,
            network,
            parent,
            attached: Mutex::new(None),
        }
    }

    /// Whether any network snapshot has been published yet
    pub fn has_network_snapshot(&self) -> bool {
        self.network.borrow().is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Spawn the arbiter and the decision applier; false if already attached
    pub fn attach(&self) -> bool {
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        if attached.as_ref().is_some_and(|token| !token.is_cancelled()) {
            debug!("Auto-tunnel service already attached");
            return false;
        }

        let token = self.parent.child_token();
        let (tx, rx) = mpsc::channel(DECISION_QUEUE);

        let arbiter = self.arbiter.clone();
        let network = self.network.clone();
        let arbiter_token = token.clone();
        tokio::spawn(async move {
            arbiter.run(network, tx, arbiter_token).await;
        });

        tokio::spawn(apply_decisions(
            Arc::clone(&self.controller),
            rx,
            token.clone(),
        ));

        *attached = Some(token);
        info!("Auto-tunnel service attached");
        true
    }

    /// Cancel the arbiter and the applier; false if nothing was attached
    pub fn detach(&self) -> bool {
        match self
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(token) => {
                token.cancel();
                info!("Auto-tunnel service detached");
                true
            }
            None => false,
        }
    }
}

async fn apply_decisions(
    controller: Arc<LifecycleController>,
    mut decisions: mpsc::Receiver<Decision>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            decision = decisions.recv() => {
                let Some(decision) = decision else { break };
                if let Err(e) = controller.apply(decision).await {
                    warn!("Failed to apply auto-tunnel decision: {}", e);
                }
            }
        }
    }
    debug!("Decision applier stopped");
}
