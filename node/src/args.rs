use std::{env, path::PathBuf};

use worker::{Result, WorkerErr};

pub const CLUSTER_ENV: &str = "CLUSTER_CONFIG";

const DEFAULT_CONFIG: &str = "experiments.json";
const DEFAULT_CLUSTER: &str = "cluster.json";
const DEFAULT_LOG_DIR: &str = "logs";

const USAGE: &str = "usage: node <experiment> [--config PATH] [--cluster PATH] [--logdir DIR]";

/// The command line of a training process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub experiment: String,
    pub config: PathBuf,
    pub cluster: PathBuf,
    pub logdir: PathBuf,
}

impl Args {
    /// Parses the arguments following the program name.
    ///
    /// # Arguments
    /// * `args` - The raw arguments.
    /// * `cluster_env` - The value of `$CLUSTER_CONFIG`, if set.
    ///
    /// # Returns
    /// The parsed arguments or a `ConfigurationError` with the usage.
    pub fn parse<I>(args: I, cluster_env: Option<String>) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut experiment = None;
        let mut config = PathBuf::from(DEFAULT_CONFIG);
        let mut cluster = PathBuf::from(cluster_env.unwrap_or_else(|| DEFAULT_CLUSTER.into()));
        let mut logdir = PathBuf::from(DEFAULT_LOG_DIR);

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let slot = match arg.as_str() {
                "--config" => &mut config,
                "--cluster" => &mut cluster,
                "--logdir" => &mut logdir,
                flag if flag.starts_with("--") => {
                    return Err(WorkerErr::config(format!("unknown flag {flag}\n{USAGE}")));
                }
                positional => {
                    if experiment.is_some() {
                        return Err(WorkerErr::config(format!(
                            "unexpected argument {positional}\n{USAGE}"
                        )));
                    }

                    experiment = Some(positional.to_string());
                    continue;
                }
            };

            let value = args
                .next()
                .ok_or_else(|| WorkerErr::config(format!("{arg} needs a value\n{USAGE}")))?;
            *slot = PathBuf::from(value);
        }

        let experiment =
            experiment.ok_or_else(|| WorkerErr::config(format!("missing experiment\n{USAGE}")))?;

        Ok(Self {
            experiment,
            config,
            cluster,
            logdir,
        })
    }

    /// Parses the process' own command line.
    pub fn from_env() -> Result<Self> {
        Self::parse(env::args().skip(1), env::var(CLUSTER_ENV).ok())
    }
}
