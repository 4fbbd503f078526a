use std::{io, time::Duration};

use comms::{
    MsgReceiver, MsgSender,
    msg::{Command, Msg, Payload},
    specs::host::{HostStatus, InitSpec},
};
use log::{debug, warn};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{Result, WorkerErr};

type Channel = (MsgReceiver<OwnedReadHalf>, MsgSender<OwnedWriteHalf>);

/// How many times to retry a failed request and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: usize,
    backoff: Duration,
}

impl RetryPolicy {
    /// Creates a new `RetryPolicy`.
    ///
    /// # Arguments
    /// * `retries` - The amount of retries after the first attempt.
    /// * `backoff` - The pause before the first retry, doubled on every following one.
    pub fn new(retries: usize, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// The pause before the `attempt`-th retry, counting from one.
    fn delay(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(6) as u32;
        self.backoff.saturating_mul(1 << exp)
    }
}

/// A single request to a host.
enum Request<'a> {
    Control(Command),
    Restore {
        global_step: u64,
        values: &'a mut [f32],
    },
    Pull(&'a mut [f32]),
    Push(&'a [f32]),
}

/// A successful answer to a `Request`.
enum Reply {
    Status(HostStatus),
    Params,
    Disconnected,
}

/// A connection to a single variable host.
///
/// Requests that fail on a transient io error reconnect and are sent again, so pushes
/// are delivered at least once. Once the retry policy is exhausted the host is
/// considered lost.
pub struct HostClient {
    addr: String,
    policy: RetryPolicy,
    chan: Option<Channel>,
    rx_buf: Vec<f32>,
}

impl HostClient {
    /// Connects to the host at `addr`.
    ///
    /// # Arguments
    /// * `addr` - The host's address.
    /// * `policy` - The retry policy for this and every following request.
    ///
    /// # Returns
    /// The connected client or `ConnectionLost` once the policy is exhausted.
    pub async fn connect(addr: impl Into<String>, policy: RetryPolicy) -> Result<Self> {
        let mut client = Self {
            addr: addr.into(),
            policy,
            chan: None,
            rx_buf: Vec::new(),
        };

        let mut attempt = 0;

        while let Err(e) = client.ensure_connected().await {
            client.backoff(&mut attempt, e).await?;
        }

        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn status(&mut self) -> Result<HostStatus> {
        self.request_status(Request::Control(Command::Status)).await
    }

    /// Fills the host's variables from scratch.
    pub async fn initialize(&mut self, spec: InitSpec) -> Result<HostStatus> {
        self.request_status(Request::Control(Command::Initialize(spec)))
            .await
    }

    /// Overwrites the host's variables and global step.
    pub async fn restore(&mut self, global_step: u64, values: &mut [f32]) -> Result<HostStatus> {
        self.request_status(Request::Restore {
            global_step,
            values,
        })
        .await
    }

    /// Copies the host's variables into `out`.
    pub async fn pull(&mut self, out: &mut [f32]) -> Result<()> {
        match self.request(Request::Pull(out)).await? {
            Reply::Params => Ok(()),
            _ => Err(self.protocol("expected params")),
        }
    }

    /// Applies a gradient to the host's variables.
    ///
    /// # Returns
    /// The host's status right after applying it.
    pub async fn push(&mut self, grad: &[f32]) -> Result<HostStatus> {
        self.request_status(Request::Push(grad)).await
    }

    pub async fn request_stop(&mut self) -> Result<HostStatus> {
        self.request_status(Request::Control(Command::RequestStop))
            .await
    }

    /// Closes the connection gracefully.
    pub async fn disconnect(mut self) -> Result<()> {
        match self.request(Request::Control(Command::Disconnect)).await? {
            Reply::Disconnected => Ok(()),
            _ => Err(self.protocol("expected a disconnect")),
        }
    }

    async fn request_status(&mut self, req: Request<'_>) -> Result<HostStatus> {
        match self.request(req).await? {
            Reply::Status(status) => Ok(status),
            _ => Err(self.protocol("expected a report")),
        }
    }

    /// Sends `req` until it gets an answer or the retry policy is exhausted.
    async fn request(&mut self, mut req: Request<'_>) -> Result<Reply> {
        let mut attempt = 0;

        loop {
            match self.try_request(&mut req).await {
                Ok(reply) => return reply,
                Err(e) => self.backoff(&mut attempt, e).await?,
            }
        }
    }

    /// Sends `req` once.
    ///
    /// # Returns
    /// An io error if the link failed, the outer result, otherwise the host's answer.
    async fn try_request(&mut self, req: &mut Request<'_>) -> io::Result<Result<Reply>> {
        self.ensure_connected().await?;

        let Self {
            addr, chan, rx_buf, ..
        } = self;

        let Some((rx, tx)) = chan else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        match req {
            Request::Control(cmd) => tx.send(&Msg::Control(cmd.clone())).await?,
            Request::Restore {
                global_step,
                values,
            } => {
                let msg = Msg::Control(Command::Restore {
                    global_step: *global_step,
                });
                tx.send(&msg).await?;
                tx.send(&Msg::Data(Payload::Params(&mut **values))).await?;
            }
            Request::Pull(_) => tx.send(&Msg::Control(Command::Pull)).await?,
            Request::Push(grad) => tx.send(&Msg::Data(Payload::Grad(*grad))).await?,
        }

        let msg: Msg = rx.recv_into(rx_buf).await?;
        debug!(host = addr.as_str(), kind = msg.kind(); "received reply");

        let protocol = |detail: String| WorkerErr::Protocol {
            addr: addr.clone(),
            detail,
        };

        let reply = match (msg, req) {
            (Msg::Err(detail), _) => Err(protocol(detail.into_owned())),
            (Msg::Data(Payload::Params(params)), Request::Pull(out)) => {
                if params.len() == out.len() {
                    out.copy_from_slice(params);
                    Ok(Reply::Params)
                } else {
                    Err(protocol(format!(
                        "pulled {} params, expected {}",
                        params.len(),
                        out.len()
                    )))
                }
            }
            (Msg::Control(Command::Disconnect), Request::Control(Command::Disconnect)) => {
                Ok(Reply::Disconnected)
            }
            (Msg::Control(Command::Report(status)), Request::Pull(_)) => Err(protocol(format!(
                "expected params, got a report {status:?}"
            ))),
            (Msg::Control(Command::Report(status)), _) => Ok(Reply::Status(status)),
            (msg, _) => Err(protocol(format!("unexpected {} reply", msg.kind()))),
        };

        Ok(reply)
    }

    /// Reconnects if the last connection broke.
    async fn ensure_connected(&mut self) -> io::Result<()> {
        if self.chan.is_none() {
            let stream = TcpStream::connect(self.addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let (rx, tx) = stream.into_split();
            debug!(host = self.addr.as_str(); "connected");
            self.chan = Some(comms::channel(rx, tx));
        }

        Ok(())
    }

    /// Drops the broken connection and waits before the next attempt.
    ///
    /// # Returns
    /// `ConnectionLost` once every retry was spent.
    async fn backoff(&mut self, attempt: &mut usize, e: io::Error) -> Result<()> {
        self.chan = None;
        *attempt += 1;

        if *attempt > self.policy.retries {
            return Err(WorkerErr::ConnectionLost {
                addr: self.addr.clone(),
                source: e,
            });
        }

        let delay = self.policy.delay(*attempt);
        warn!(
            host = self.addr.as_str(), attempt = *attempt;
            "request failed ({e}), retrying in {delay:?}"
        );

        time::sleep(delay).await;
        Ok(())
    }

    fn protocol(&self, detail: &str) -> WorkerErr {
        WorkerErr::Protocol {
            addr: self.addr.clone(),
            detail: detail.to_string(),
        }
    }
}
