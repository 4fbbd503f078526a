use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::host::{HostStatus, InitSpec},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const GRAD: Header = 2;
const PARAMS: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    Grad(&'a [f32]),
    Params(&'a mut [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Asks a host for its current `HostStatus`.
    Status,
    /// A host's answer to any request that doesn't carry parameters back.
    Report(HostStatus),
    /// Fills a host's variables from parameter generators.
    Initialize(InitSpec),
    /// Announces that the next message is a `Params` payload restoring the host's variables.
    Restore { global_step: u64 },
    /// Asks a host for a copy of its variables.
    Pull,
    /// Raises the cluster wide should-stop flag.
    RequestStop,
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short human readable name for this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Err(_) => "err",
            Msg::Data(Payload::Grad(_)) => "data/grad",
            Msg::Data(Payload::Params(_)) => "data/params",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, nums): (Header, &[f32]) = match payload {
                    Payload::Grad(grad) => (GRAD, grad),
                    Payload::Params(params) => (PARAMS, params),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind @ (GRAD | PARAMS) => {
                let nums = bytemuck::try_cast_slice_mut(rest).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Received a malformed f32 payload: {e:?}"),
                    )
                })?;

                let payload = if kind == GRAD {
                    Payload::Grad(nums)
                } else {
                    Payload::Params(nums)
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind_byte(kind),
        }
    }
}
