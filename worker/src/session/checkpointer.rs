use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::{
    task::{self, JoinHandle},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    Result, WorkerErr,
    checkpoint::{Checkpoint, SavedVariable, Saver},
    net::HostClient,
    placement::VariableLayout,
};

/// Reads every variable and the global step out of the hosts.
pub(super) struct Snapshotter {
    clients: Vec<HostClient>,
    layout: VariableLayout,
    host_bufs: Vec<Vec<f32>>,
}

impl Snapshotter {
    /// Creates a new `Snapshotter`.
    ///
    /// # Arguments
    /// * `clients` - A connection to every host, in task order.
    /// * `layout` - Where every variable lives.
    pub fn new(clients: Vec<HostClient>, layout: VariableLayout) -> Self {
        let host_bufs = layout.hosts().iter().map(|host| vec![0.; host.len]).collect();

        Self {
            clients,
            layout,
            host_bufs,
        }
    }

    /// Takes a snapshot of the current training state.
    ///
    /// The hosts keep training while they're read, so the variables may be a few steps
    /// ahead of the recorded global step.
    pub async fn snapshot(&mut self) -> Result<Checkpoint> {
        let gs_host = self.layout.global_step_host().get();
        let client = &mut self.clients[gs_host];
        let status = client.status().await?;

        let global_step = status.global_step.ok_or_else(|| WorkerErr::Protocol {
            addr: client.addr().to_string(),
            detail: "the global step host didn't report it".into(),
        })?;

        for (client, buf) in self.clients.iter_mut().zip(&mut self.host_bufs) {
            client.pull(buf).await?;
        }

        let variables = self
            .layout
            .slots()
            .iter()
            .map(|slot| SavedVariable {
                name: slot.name.clone(),
                values: self.host_bufs[slot.host.get()][slot.offset..slot.offset + slot.len]
                    .to_vec(),
            })
            .collect();

        Ok(Checkpoint {
            global_step,
            variables,
        })
    }

    /// Snapshots the hosts and writes the checkpoint, logging any failure.
    async fn save(&mut self, saver: &Saver) {
        let checkpoint = match self.snapshot().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!("failed to snapshot the variables: {e}");
                return;
            }
        };

        let saver = saver.clone();
        match task::spawn_blocking(move || saver.save(&checkpoint)).await {
            Ok(Ok(path)) => debug!("checkpoint written to {}", path.display()),
            Ok(Err(e)) => error!("{e}"),
            Err(e) => error!("checkpoint task failed: {e}"),
        }
    }

    async fn disconnect(self) {
        for client in self.clients {
            let addr = client.addr().to_string();

            if let Err(e) = client.disconnect().await {
                warn!(host = addr.as_str(); "failed to disconnect: {e}");
            }
        }
    }
}

/// Periodically checkpoints the hosts on its own task.
pub(super) struct Checkpointer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Checkpointer {
    /// Starts checkpointing every `period`, the first checkpoint is written one period
    /// from now.
    ///
    /// # Arguments
    /// * `snapshotter` - Reads the state to checkpoint.
    /// * `saver` - Writes the checkpoints.
    /// * `period` - The time between two checkpoints.
    ///
    /// # Returns
    /// A new running `Checkpointer`.
    pub fn spawn(mut snapshotter: Snapshotter, saver: Saver, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("checkpointing to {} every {period:?}", saver.dir().display());

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => snapshotter.save(&saver).await,
                }
            }

            info!("writing the final checkpoint");
            snapshotter.save(&saver).await;
            snapshotter.disconnect().await;
        });

        Self { token, handle }
    }

    /// Writes a last checkpoint and stops.
    pub async fn shutdown(self) {
        self.token.cancel();

        if let Err(e) = self.handle.await {
            error!("checkpointer task failed: {e}");
        }
    }
}
