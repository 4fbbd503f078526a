use comms::{MsgReceiver, MsgSender, specs::host::HostStatus};
use tokio::io::{AsyncRead, AsyncWrite};

/// This trait acts as an indirection layer, allowing the `HostBuilder` to return
/// and manage different `VariableHost` configurations from it's unique build method.
#[async_trait::async_trait]
pub trait Host<R, W>: Send
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Indirection method for `VariableHost::run`.
    async fn run(&mut self);

    /// Indirection method for `VariableHost::spawn`.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    fn spawn(&mut self, rx: MsgReceiver<R>, tx: MsgSender<W>);

    /// Indirection method for `VariableHost::status`.
    fn status(&self) -> HostStatus;
}
