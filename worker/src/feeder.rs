use log::{debug, warn};
use tokio::{
    sync::mpsc::{self, Receiver},
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;

/// Produces training examples on the blocking pool ahead of the training loop.
///
/// The examples go through a bounded queue, so the producer blocks once `capacity`
/// examples are waiting to be consumed.
pub struct Feeder<T> {
    rx: Receiver<T>,
    token: CancellationToken,
    handle: JoinHandle<usize>,
}

impl<T: Send + 'static> Feeder<T> {
    /// Starts feeding the examples of `iter`.
    ///
    /// # Arguments
    /// * `iter` - The example source, consumed on the blocking pool.
    /// * `capacity` - The maximum amount of queued examples.
    /// * `token` - Stops the producer once cancelled.
    ///
    /// # Returns
    /// A new feeder.
    pub fn spawn<I>(iter: I, capacity: usize, token: CancellationToken) -> Self
    where
        I: IntoIterator<Item = T> + Send + 'static,
        I::IntoIter: Send,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let producer_token = token.clone();

        let handle = task::spawn_blocking(move || {
            let mut fed = 0;

            for example in iter {
                if producer_token.is_cancelled() || tx.blocking_send(example).is_err() {
                    break;
                }

                fed += 1;
            }

            debug!(fed = fed; "feeder finished");
            fed
        });

        Self { rx, token, handle }
    }

    /// Takes the next example.
    ///
    /// # Returns
    /// `None` once the source is exhausted or the feeder was stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stops the producer and waits for it to finish.
    ///
    /// # Returns
    /// The amount of examples it produced.
    pub async fn shutdown(self) -> usize {
        let Self { rx, token, handle } = self;

        token.cancel();
        // unblocks a producer waiting on a full queue
        drop(rx);

        match handle.await {
            Ok(fed) => fed,
            Err(e) => {
                warn!("feeder task failed: {e}");
                0
            }
        }
    }
}
