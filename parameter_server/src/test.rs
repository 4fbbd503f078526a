#![cfg(test)]

use std::{borrow::Cow, num::NonZeroUsize};

use comms::{
    MsgReceiver, MsgSender,
    msg::{Command, Msg, Payload},
    specs::{
        host::{HostStatus, InitSpec},
        server::{OptimizerSpec, ParamGenSpec},
    },
};
use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};

use crate::service::{Host, HostBuilder, HostSpec};

type Rx = MsgReceiver<ReadHalf<DuplexStream>>;
type Tx = MsgSender<WriteHalf<DuplexStream>>;

const NPARAMS: usize = 3;

fn channel_pair() -> ((Rx, Tx), (Rx, Tx)) {
    let (stream1, stream2) = io::duplex(4096);
    let (rx1, tx1) = io::split(stream1);
    let (rx2, tx2) = io::split(stream2);
    (comms::channel(rx1, tx1), comms::channel(rx2, tx2))
}

fn host(owns_global_step: bool) -> Box<dyn Host<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>> {
    let spec = HostSpec {
        nparams: NPARAMS,
        shard_size: NonZeroUsize::new(2).unwrap(),
        optimizer: OptimizerSpec::GradientDescent { learning_rate: 1.0 },
        owns_global_step,
    };

    HostBuilder::new().build(spec)
}

fn init_spec(global_step: u64) -> InitSpec {
    InitSpec {
        global_step,
        variables: vec![
            ParamGenSpec::Const {
                value: 1.0,
                limit: 2,
            },
            ParamGenSpec::Const {
                value: 2.0,
                limit: 1,
            },
        ],
        seed: None,
    }
}

async fn request(rx: &mut Rx, tx: &mut Tx, cmd: Command) -> io::Result<HostStatus> {
    tx.send(&Msg::Control(cmd)).await?;
    expect_report(rx).await
}

async fn expect_report(rx: &mut Rx) -> io::Result<HostStatus> {
    let mut buf: Vec<u32> = Vec::new();

    match rx.recv_into(&mut buf).await? {
        Msg::Control(Command::Report(status)) => Ok(status),
        msg => panic!("expected a report, got {msg:?}"),
    }
}

async fn pull(rx: &mut Rx, tx: &mut Tx) -> io::Result<Result<Vec<f32>, String>> {
    tx.send(&Msg::Control(Command::Pull)).await?;
    let mut buf: Vec<f32> = Vec::new();

    let res = match rx.recv_into(&mut buf).await? {
        Msg::Data(Payload::Params(params)) => Ok(params.to_vec()),
        Msg::Err(detail) => Err(detail.into_owned()),
        msg => panic!("expected params, got {msg:?}"),
    };

    Ok(res)
}

async fn disconnect(rx: &mut Rx, tx: &mut Tx) -> io::Result<()> {
    tx.send(&Msg::Control(Command::Disconnect)).await?;
    let mut buf: Vec<u32> = Vec::new();

    assert!(matches!(
        rx.recv_into(&mut buf).await?,
        Msg::Control(Command::Disconnect)
    ));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn uninitialized_host_refuses_pulls() -> io::Result<()> {
    let ((mut rx, mut tx), (h_rx, h_tx)) = channel_pair();
    let mut host = host(true);
    host.spawn(h_rx, h_tx);

    let status = request(&mut rx, &mut tx, Command::Status).await?;
    assert_eq!(
        status,
        HostStatus {
            initialized: false,
            global_step: Some(0),
            should_stop: false,
        }
    );

    assert!(pull(&mut rx, &mut tx).await?.is_err());

    disconnect(&mut rx, &mut tx).await?;
    host.run().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn gradients_advance_the_global_step() -> io::Result<()> {
    let ((mut rx, mut tx), (h_rx, h_tx)) = channel_pair();
    let mut host = host(true);
    host.spawn(h_rx, h_tx);

    let status = request(&mut rx, &mut tx, Command::Initialize(init_spec(10))).await?;
    assert!(status.initialized);
    assert_eq!(status.global_step, Some(10));
    assert_eq!(pull(&mut rx, &mut tx).await?, Ok(vec![1.0, 1.0, 2.0]));

    let grad = [0.5, 0.5, 0.5];
    tx.send(&Msg::Data(Payload::Grad(&grad))).await?;
    assert_eq!(expect_report(&mut rx).await?.global_step, Some(11));
    assert_eq!(pull(&mut rx, &mut tx).await?, Ok(vec![0.5, 0.5, 1.5]));

    let status = request(&mut rx, &mut tx, Command::RequestStop).await?;
    assert!(status.should_stop);
    assert!(host.status().should_stop);

    disconnect(&mut rx, &mut tx).await?;
    host.run().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_gradients_are_rejected() -> io::Result<()> {
    let ((mut rx, mut tx), (h_rx, h_tx)) = channel_pair();
    let mut host = host(true);
    host.spawn(h_rx, h_tx);

    request(&mut rx, &mut tx, Command::Initialize(init_spec(0))).await?;

    let grad = [1.0];
    tx.send(&Msg::Data(Payload::Grad(&grad))).await?;
    let mut buf: Vec<u32> = Vec::new();
    assert!(matches!(rx.recv_into(&mut buf).await?, Msg::Err(_)));

    let status = request(&mut rx, &mut tx, Command::Status).await?;
    assert_eq!(status.global_step, Some(0));

    disconnect(&mut rx, &mut tx).await?;
    host.run().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_overwrites_variables_and_step() -> io::Result<()> {
    let ((mut rx, mut tx), (h_rx, h_tx)) = channel_pair();
    let mut host = host(true);
    host.spawn(h_rx, h_tx);

    tx.send(&Msg::Control(Command::Restore { global_step: 42 }))
        .await?;
    let mut values = [3.0, 4.0, 5.0];
    tx.send(&Msg::Data(Payload::Params(&mut values))).await?;

    let status = expect_report(&mut rx).await?;
    assert!(status.initialized);
    assert_eq!(status.global_step, Some(42));
    assert_eq!(pull(&mut rx, &mut tx).await?, Ok(vec![3.0, 4.0, 5.0]));

    disconnect(&mut rx, &mut tx).await?;
    host.run().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn only_the_owner_reports_a_global_step() -> io::Result<()> {
    let ((mut rx, mut tx), (h_rx, h_tx)) = channel_pair();
    let mut host = host(false);
    host.spawn(h_rx, h_tx);

    let status = request(&mut rx, &mut tx, Command::Initialize(init_spec(5))).await?;
    assert_eq!(status.global_step, None);

    let grad = [0.0; NPARAMS];
    tx.send(&Msg::Data(Payload::Grad(&grad))).await?;
    assert_eq!(expect_report(&mut rx).await?.global_step, None);

    disconnect(&mut rx, &mut tx).await?;
    host.run().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_messages_close_the_connection() -> io::Result<()> {
    let ((mut rx, mut tx), (h_rx, h_tx)) = channel_pair();
    let mut host = host(true);
    host.spawn(h_rx, h_tx);

    tx.send(&Msg::Err(Cow::Borrowed("boom"))).await?;
    let mut buf: Vec<u32> = Vec::new();
    assert!(matches!(rx.recv_into(&mut buf).await?, Msg::Err(_)));

    host.run().await;
    Ok(())
}
