use futures::future::try_join_all;
use log::{debug, info, warn};
use machine_learning::TrainableModel;
use tokio::task;

use super::{StepOutput, TrainingSession, checkpointer::Checkpointer};
use crate::{Result, WorkerErr, net::HostClient, placement::VariableLayout};

/// A prepared session over every variable host of the cluster.
///
/// Parameters are pulled from and gradients pushed to every host concurrently, the
/// model runs in between on the current thread without blocking the runtime.
pub struct ManagedSession {
    layout: VariableLayout,
    clients: Vec<HostClient>,
    checkpointer: Option<Checkpointer>,
    host_params: Vec<Vec<f32>>,
    host_grads: Vec<Vec<f32>>,
    params: Vec<f32>,
    grad: Vec<f32>,
    cluster_stop: bool,
    local_stop: bool,
}

impl ManagedSession {
    pub(super) fn new(
        layout: VariableLayout,
        clients: Vec<HostClient>,
        checkpointer: Option<Checkpointer>,
    ) -> Self {
        let host_bufs: Vec<Vec<f32>> = layout
            .hosts()
            .iter()
            .map(|host| vec![0.; host.len])
            .collect();

        let nparams = layout.nparams();

        Self {
            layout,
            clients,
            checkpointer,
            host_grads: host_bufs.clone(),
            host_params: host_bufs,
            params: vec![0.; nparams],
            grad: vec![0.; nparams],
            cluster_stop: false,
            local_stop: false,
        }
    }

    /// Whether this session writes checkpoints.
    pub fn is_chief(&self) -> bool {
        self.checkpointer.is_some()
    }

    fn global_step_client(&mut self) -> &mut HostClient {
        &mut self.clients[self.layout.global_step_host().get()]
    }

    fn missing_step(client: &HostClient) -> WorkerErr {
        WorkerErr::Protocol {
            addr: client.addr().to_string(),
            detail: "the global step host didn't report it".into(),
        }
    }
}

impl TrainingSession for ManagedSession {
    async fn global_step(&mut self) -> Result<u64> {
        let client = self.global_step_client();
        let status = client.status().await?;
        let global_step = status
            .global_step
            .ok_or_else(|| Self::missing_step(client))?;

        self.cluster_stop |= status.should_stop;
        Ok(global_step)
    }

    async fn run_step<M>(&mut self, model: &mut M, example: M::Example) -> Result<StepOutput>
    where
        M: TrainableModel,
    {
        let Self {
            layout,
            clients,
            host_params,
            host_grads,
            params,
            grad,
            cluster_stop,
            ..
        } = self;

        let pulls = clients
            .iter_mut()
            .zip(host_params.iter_mut())
            .map(|(client, buf)| client.pull(buf));

        try_join_all(pulls).await?;
        layout.gather(host_params, params);

        grad.fill(0.);
        let loss = task::block_in_place(|| model.train_step(params, grad, &example))?;
        layout.scatter(grad, host_grads);

        let pushes = clients
            .iter_mut()
            .zip(host_grads.iter())
            .map(|(client, grad)| client.push(grad));

        let statuses = try_join_all(pushes).await?;

        let gs_host = layout.global_step_host().get();
        let status = statuses[gs_host];
        let global_step = status
            .global_step
            .ok_or_else(|| Self::missing_step(&clients[gs_host]))?;

        if status.should_stop && !*cluster_stop {
            info!(global_step = global_step; "the cluster was asked to stop");
        }

        *cluster_stop |= status.should_stop;
        debug!(global_step = global_step, loss = loss; "step done");

        Ok(StepOutput { loss, global_step })
    }

    fn should_stop(&self) -> bool {
        self.cluster_stop || self.local_stop
    }

    async fn request_stop(&mut self) {
        self.local_stop = true;

        match self.global_step_client().request_stop().await {
            Ok(status) => self.cluster_stop |= status.should_stop,
            Err(e) => warn!("failed to request a cluster wide stop: {e}"),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.shutdown().await;
        }

        for client in self.clients.drain(..) {
            let addr = client.addr().to_string();

            if let Err(e) = client.disconnect().await {
                warn!(host = addr.as_str(); "failed to disconnect: {e}");
            }
        }

        info!("session closed");
        Ok(())
    }
}
