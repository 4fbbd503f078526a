//! Replica device placement: which process runs, or hosts, every part of the training graph.

use std::fmt;

use comms::specs::{host::InitSpec, server::ParamGenSpec};
use machine_learning::VariableSpec;

use crate::{
    Result,
    cluster::{ClusterDescriptor, TaskIndex, WORKER_JOB},
};

/// The kind of device an operation is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// A fully qualified device, rendered as `/job:worker/task:<i>/device:<KIND>:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub task: TaskIndex,
    pub kind: DeviceKind,
    pub index: u32,
}

impl Device {
    pub fn cpu(task: TaskIndex) -> Self {
        Self {
            task,
            kind: DeviceKind::Cpu,
            index: 0,
        }
    }

    pub fn gpu(task: TaskIndex, index: u32) -> Self {
        Self {
            task,
            kind: DeviceKind::Gpu,
            index,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
        };

        write!(
            f,
            "/job:{WORKER_JOB}/task:{}/device:{kind}:{}",
            self.task, self.index
        )
    }
}

/// An operation of the training graph that needs a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Model computation, optionally pinned to an explicit device.
    Compute { device: Option<Device> },
    /// The `index`-th variable declared by the model.
    Variable { index: usize },
    GlobalStep,
}

/// The placement rule of a single process, computed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaPlacement {
    task: TaskIndex,
    ntasks: usize,
    has_gpus: bool,
}

impl ReplicaPlacement {
    /// Creates the placement rule of `task`.
    ///
    /// # Returns
    /// The rule or a `ConfigurationError` if `task` is not part of the cluster.
    pub fn new(task: TaskIndex, cluster: &ClusterDescriptor) -> Result<Self> {
        let entry = cluster.entry(task)?;

        Ok(Self {
            task,
            ntasks: cluster.len(),
            has_gpus: entry.has_gpus(),
        })
    }

    pub fn task(&self) -> TaskIndex {
        self.task
    }

    /// The device this process runs unpinned computations on.
    pub fn worker_device(&self) -> Device {
        if self.has_gpus {
            Device::gpu(self.task, 0)
        } else {
            Device::cpu(self.task)
        }
    }

    /// The task hosting the `index`-th variable, assigned round robin.
    pub fn variable_host(&self, index: usize) -> TaskIndex {
        TaskIndex::new(index % self.ntasks)
    }

    /// The task hosting the global step and the should-stop flag.
    pub fn global_step_host(&self) -> TaskIndex {
        TaskIndex::LEADER
    }

    /// Resolves the device of `op`.
    pub fn place(&self, op: &Op) -> Device {
        match *op {
            Op::Compute {
                device: Some(device),
            } => device,
            Op::Compute { device: None } => self.worker_device(),
            Op::Variable { index } => Device::cpu(self.variable_host(index)),
            Op::GlobalStep => Device::cpu(self.global_step_host()),
        }
    }

    /// Lays the model's variables out on their hosts.
    ///
    /// # Arguments
    /// * `variables` - The model's variables, in declaration order.
    ///
    /// # Returns
    /// Where every variable lives and what every host stores.
    pub fn layout(&self, variables: &[VariableSpec]) -> VariableLayout {
        let mut hosts: Vec<HostLayout> = (0..self.ntasks)
            .map(|task| HostLayout {
                task: TaskIndex::new(task),
                variables: Vec::new(),
                len: 0,
            })
            .collect();

        let slots = variables
            .iter()
            .enumerate()
            .map(|(index, var)| {
                let host = &mut hosts[self.variable_host(index).get()];
                let slot = VariableSlot {
                    name: var.name.clone(),
                    host: host.task,
                    offset: host.len,
                    len: var.len,
                    init: var.init.clone(),
                };

                host.variables.push(index);
                host.len += var.len;
                slot
            })
            .collect();

        VariableLayout {
            hosts,
            slots,
            global_step_host: self.global_step_host(),
        }
    }
}

/// Where a single variable lives.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSlot {
    pub name: String,
    pub host: TaskIndex,
    /// The position of the variable's first value within its host's storage.
    pub offset: usize,
    pub len: usize,
    pub init: ParamGenSpec,
}

/// What a single host stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub task: TaskIndex,
    /// The indices of the variables it hosts, in storage order.
    pub variables: Vec<usize>,
    /// The total amount of parameters it stores.
    pub len: usize,
}

/// The placement of every variable of the model across the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableLayout {
    hosts: Vec<HostLayout>,
    slots: Vec<VariableSlot>,
    global_step_host: TaskIndex,
}

impl VariableLayout {
    pub fn hosts(&self) -> &[HostLayout] {
        &self.hosts
    }

    pub fn slots(&self) -> &[VariableSlot] {
        &self.slots
    }

    pub fn global_step_host(&self) -> TaskIndex {
        self.global_step_host
    }

    /// The amount of parameters stored by `task`, zero for tasks outside the cluster.
    pub fn host_len(&self, task: TaskIndex) -> usize {
        self.hosts.get(task.get()).map_or(0, |host| host.len)
    }

    /// The total amount of parameters of the model.
    pub fn nparams(&self) -> usize {
        self.slots.iter().map(|slot| slot.len).sum()
    }

    /// Copies every host's storage into a flat buffer in declaration order.
    ///
    /// # Arguments
    /// * `host_bufs` - One buffer per host, as pulled from it.
    /// * `flat` - A buffer of `nparams` values.
    pub fn gather(&self, host_bufs: &[Vec<f32>], flat: &mut [f32]) {
        let mut start = 0;

        for slot in &self.slots {
            let src = &host_bufs[slot.host.get()][slot.offset..slot.offset + slot.len];
            flat[start..start + slot.len].copy_from_slice(src);
            start += slot.len;
        }
    }

    /// Splits a flat buffer in declaration order into every host's storage.
    ///
    /// # Arguments
    /// * `flat` - A buffer of `nparams` values.
    /// * `host_bufs` - One buffer per host, sized as its layout.
    pub fn scatter(&self, flat: &[f32], host_bufs: &mut [Vec<f32>]) {
        let mut start = 0;

        for slot in &self.slots {
            let dst = &mut host_bufs[slot.host.get()][slot.offset..slot.offset + slot.len];
            dst.copy_from_slice(&flat[start..start + slot.len]);
            start += slot.len;
        }
    }

    /// Builds the fresh initialization of `task`'s variables.
    ///
    /// # Arguments
    /// * `task` - The host to initialize.
    /// * `seed` - The cluster seed, each host derives its own from it.
    ///
    /// # Returns
    /// The spec to send to the host.
    pub fn init_spec(&self, task: TaskIndex, seed: Option<u64>) -> InitSpec {
        let variables = self
            .hosts
            .get(task.get())
            .map(|host| {
                host.variables
                    .iter()
                    .map(|&i| self.slots[i].init.clone())
                    .collect()
            })
            .unwrap_or_default();

        InitSpec {
            global_step: 0,
            variables,
            seed: seed.map(|seed| seed.wrapping_add(task.get() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ntasks: usize, gpus: Vec<Vec<u32>>) -> ClusterDescriptor {
        let addresses = (0..ntasks).map(|i| format!("127.0.0.1:{}", 2222 + i)).collect();
        ClusterDescriptor::new(addresses, gpus).unwrap()
    }

    fn variables(lens: &[usize]) -> Vec<VariableSpec> {
        lens.iter()
            .enumerate()
            .map(|(i, &len)| VariableSpec {
                name: format!("v{i}"),
                len,
                init: ParamGenSpec::Const {
                    value: i as f32,
                    limit: len,
                },
            })
            .collect()
    }

    #[test]
    fn unpinned_compute_runs_on_the_local_worker() {
        let cluster = cluster(2, vec![vec![], vec![3]]);

        let cpu = ReplicaPlacement::new(TaskIndex::new(0), &cluster).unwrap();
        let gpu = ReplicaPlacement::new(TaskIndex::new(1), &cluster).unwrap();
        let op = Op::Compute { device: None };

        assert_eq!(cpu.place(&op).to_string(), "/job:worker/task:0/device:CPU:0");
        assert_eq!(gpu.place(&op).to_string(), "/job:worker/task:1/device:GPU:0");
    }

    #[test]
    fn explicit_placement_wins() {
        let cluster = cluster(2, vec![]);
        let placement = ReplicaPlacement::new(TaskIndex::new(1), &cluster).unwrap();
        let pinned = Device::gpu(TaskIndex::new(0), 1);

        let op = Op::Compute {
            device: Some(pinned),
        };

        assert_eq!(placement.place(&op), pinned);
    }

    #[test]
    fn variables_are_placed_round_robin() {
        let cluster = cluster(3, vec![]);
        let placement = ReplicaPlacement::new(TaskIndex::new(2), &cluster).unwrap();

        let hosts: Vec<_> = (0..5)
            .map(|index| placement.place(&Op::Variable { index }).task.get())
            .collect();

        assert_eq!(hosts, [0, 1, 2, 0, 1]);
        assert_eq!(placement.place(&Op::GlobalStep).task, TaskIndex::LEADER);
    }

    #[test]
    fn placement_requires_a_cluster_entry() {
        let cluster = cluster(2, vec![]);
        assert!(ReplicaPlacement::new(TaskIndex::new(2), &cluster).is_err());
    }

    #[test]
    fn layout_concatenates_variables_per_host() {
        let cluster = cluster(2, vec![]);
        let placement = ReplicaPlacement::new(TaskIndex::new(0), &cluster).unwrap();
        let layout = placement.layout(&variables(&[2, 1, 3]));

        assert_eq!(layout.nparams(), 6);
        assert_eq!(layout.hosts()[0].variables, [0, 2]);
        assert_eq!(layout.host_len(TaskIndex::new(0)), 5);
        assert_eq!(layout.host_len(TaskIndex::new(1)), 1);
        assert_eq!(layout.slots()[2].offset, 2);

        let init = layout.init_spec(TaskIndex::new(0), Some(10));
        assert_eq!(init.variables.len(), 2);
        assert_eq!(init.seed, Some(10));
        assert_eq!(layout.init_spec(TaskIndex::new(1), Some(10)).seed, Some(11));
    }

    #[test]
    fn gather_and_scatter_follow_declaration_order() {
        let cluster = cluster(2, vec![]);
        let placement = ReplicaPlacement::new(TaskIndex::new(0), &cluster).unwrap();
        let layout = placement.layout(&variables(&[2, 1, 3]));

        let host_bufs = vec![vec![0., 1., 4., 5., 6.], vec![2.]];
        let mut flat = vec![0.; 6];
        layout.gather(&host_bufs, &mut flat);
        assert_eq!(flat, [0., 1., 2., 4., 5., 6.]);

        let mut scattered = vec![vec![0.; 5], vec![0.; 1]];
        layout.scatter(&flat, &mut scattered);
        assert_eq!(scattered, host_bufs);
    }
}
