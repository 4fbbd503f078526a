use std::{
    borrow::Cow,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use comms::{
    MsgReceiver, MsgSender,
    msg::{Command, Msg, Payload},
    specs::host::{HostStatus, InitSpec},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinSet,
};

use crate::{initialization, optimization::Optimizer, service::Host, storage::ParameterHandle};

/// The state shared by every connection of a single host.
struct SharedState<O: Optimizer> {
    handle: ParameterHandle<O>,
    global_step: Arc<AtomicU64>,
    should_stop: Arc<AtomicBool>,
    owns_global_step: bool,
}

impl<O: Optimizer> Clone for SharedState<O> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            global_step: Arc::clone(&self.global_step),
            should_stop: Arc::clone(&self.should_stop),
            owns_global_step: self.owns_global_step,
        }
    }
}

/// Serves a slice of the model's variables to every process connected to it.
///
/// The host owning the global step also owns the cluster wide should-stop flag, every
/// gradient it applies advances the step by one.
pub struct VariableHost<O: Optimizer> {
    tasks: JoinSet<()>,
    state: SharedState<O>,
}

impl<O: Optimizer> VariableHost<O> {
    /// Creates a new `VariableHost`.
    ///
    /// # Arguments
    /// * `handle` - The handle to the host's parameter store.
    /// * `owns_global_step` - Whether this host holds the global step.
    ///
    /// # Returns
    /// A new `VariableHost` instance.
    pub fn new(handle: ParameterHandle<O>, owns_global_step: bool) -> Self {
        Self {
            tasks: JoinSet::new(),
            state: SharedState {
                handle,
                global_step: Arc::new(AtomicU64::new(0)),
                should_stop: Arc::new(AtomicBool::new(false)),
                owns_global_step,
            },
        }
    }

    /// Waits for every connection to finish.
    pub async fn run(&mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!("connection task failed: {e}");
            }
        }
    }

    /// A snapshot of the host's training state.
    pub fn status(&self) -> HostStatus {
        self.state.status()
    }
}

impl<O: Optimizer + Send + 'static> VariableHost<O> {
    /// Binds a new connection to this host and spawns it's own serving task.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: MsgReceiver<R>, tx: MsgSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = self.state.clone();

        self.tasks.spawn(async move {
            if let Err(e) = state.serve(rx, tx).await {
                warn!("connection closed with an error: {e}");
            }
        });
    }
}

impl<O: Optimizer> SharedState<O> {
    fn status(&self) -> HostStatus {
        let global_step = self
            .owns_global_step
            .then(|| self.global_step.load(Ordering::Acquire));

        HostStatus {
            initialized: self.handle.is_initialized(),
            global_step,
            should_stop: self.should_stop.load(Ordering::Acquire),
        }
    }

    /// Resets the shared state after the variables were (re)filled.
    fn reset(&self, global_step: u64) {
        if self.owns_global_step {
            self.global_step.store(global_step, Ordering::Release);
        }

        self.should_stop.store(false, Ordering::Release);
    }
}

impl<O: Optimizer + Send> SharedState<O> {
    /// Serves a single connection until it disconnects.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    ///
    /// # Returns
    /// An io error if the connection broke or the peer broke the protocol.
    async fn serve<R, W>(&self, mut rx: MsgReceiver<R>, mut tx: MsgSender<W>) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut rx_buf: Vec<f32> = Vec::new();
        let mut restore_buf: Vec<f32> = Vec::new();
        let mut params = vec![0.; self.handle.len()];

        loop {
            let msg: Msg<'_> = match rx.recv_into(&mut rx_buf).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("peer hung up");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            debug!(kind = msg.kind(); "received message");

            match msg {
                Msg::Control(Command::Status) => self.report(&mut tx, self.status()).await?,
                Msg::Control(Command::Initialize(spec)) => self.initialize(&mut tx, spec).await?,
                Msg::Control(Command::Restore { global_step }) => {
                    let msg: Msg<'_> = rx.recv_into(&mut restore_buf).await?;
                    let Msg::Data(Payload::Params(values)) = msg else {
                        return self.protocol_violation(&mut tx, msg).await;
                    };

                    match self.handle.assign(values).await {
                        Ok(()) => {
                            self.reset(global_step);
                            info!(global_step = global_step; "variables restored");
                            self.report(&mut tx, self.status()).await?;
                        }
                        Err(e) => Self::reject(&mut tx, e).await?,
                    }
                }
                Msg::Control(Command::Pull) => match self.handle.pull(&mut params).await {
                    Ok(()) => {
                        let msg = Msg::Data(Payload::Params(&mut params));
                        tx.send(&msg).await?;
                    }
                    Err(e) => Self::reject(&mut tx, e).await?,
                },
                Msg::Data(Payload::Grad(grad)) => match self.handle.apply(grad).await {
                    Ok(()) => {
                        let mut status = self.status();

                        if self.owns_global_step {
                            let step = self.global_step.fetch_add(1, Ordering::AcqRel) + 1;
                            status.global_step = Some(step);
                        }

                        self.report(&mut tx, status).await?;
                    }
                    Err(e) => Self::reject(&mut tx, e).await?,
                },
                Msg::Control(Command::RequestStop) => {
                    if !self.should_stop.swap(true, Ordering::AcqRel) {
                        info!("stop requested");
                    }

                    self.report(&mut tx, self.status()).await?;
                }
                Msg::Control(Command::Disconnect) => {
                    tx.send(&Msg::Control(Command::Disconnect)).await?;
                    return Ok(());
                }
                msg => return self.protocol_violation(&mut tx, msg).await,
            }
        }
    }

    /// Fills the variables from their generator specs.
    async fn initialize<W>(&self, tx: &mut MsgSender<W>, spec: InitSpec) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let values = match initialization::generate(&spec, self.handle.len()) {
            Ok(values) => values,
            Err(e) => return Self::reject(tx, e).await,
        };

        match self.handle.assign(&values).await {
            Ok(()) => {
                self.reset(spec.global_step);
                info!(global_step = spec.global_step; "variables initialized");
                self.report(tx, self.status()).await
            }
            Err(e) => Self::reject(tx, e).await,
        }
    }

    async fn report<W>(&self, tx: &mut MsgSender<W>, status: HostStatus) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tx.send(&Msg::Control(Command::Report(status))).await
    }

    /// Answers a request that couldn't be fulfilled, the connection stays open.
    async fn reject<W, E>(tx: &mut MsgSender<W>, err: E) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        E: ToString,
    {
        let detail = err.to_string();
        warn!("rejecting request: {detail}");
        tx.send(&Msg::Err(Cow::Owned(detail))).await
    }

    /// Notifies the peer that it sent an unexpected message and closes the connection.
    async fn protocol_violation<W>(&self, tx: &mut MsgSender<W>, msg: Msg<'_>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let detail = format!("unexpected {} message", msg.kind());
        tx.send(&Msg::Err(Cow::Borrowed(&detail))).await?;
        Err(io::Error::new(io::ErrorKind::InvalidData, detail))
    }
}

#[async_trait::async_trait]
impl<R, W, O> Host<R, W> for VariableHost<O>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    O: Optimizer + Send + Sync + 'static,
{
    /// Indirection call to `Self::run`.
    async fn run(&mut self) {
        self.run().await
    }

    /// Indirection call to `Self::spawn`.
    fn spawn(&mut self, rx: MsgReceiver<R>, tx: MsgSender<W>) {
        self.spawn(rx, tx)
    }

    /// Indirection call to `Self::status`.
    fn status(&self) -> HostStatus {
        self.status()
    }
}
