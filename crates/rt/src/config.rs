//! Runtime configuration: schedulers, cluster calls and channel policies.

use crate::port::{CoreId, FC_CORE_ID};
use crate::sched::ErrorCallback;
use crate::trace::TraceHook;

/// Configuration for an event scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub name: &'static str,
    pub core: CoreId,
    pub trace: Option<TraceHook>,
    pub error_handler: Option<(ErrorCallback, usize)>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "fc",
            core: FC_CORE_ID,
            trace: None,
            error_handler: None,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new scheduler configuration builder.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Builder for scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Sets the scheduler name used in log output.
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the core the scheduler runs on.
    pub fn core(mut self, core: CoreId) -> Self {
        self.config.core = core;
        self
    }

    /// Installs a trace hook.
    pub fn trace(mut self, hook: TraceHook) -> Self {
        self.config.trace = Some(hook);
        self
    }

    /// Installs the error callback and the argument passed back to it.
    pub fn error_handler(mut self, callback: ErrorCallback, arg: usize) -> Self {
        self.config.error_handler = Some((callback, arg));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

/// Sizing for a cluster call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterConfig {
    pub nb_pe: u32,
    pub master_stack_size: usize,
    pub slave_stack_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nb_pe: 8,
            master_stack_size: 1024,
            slave_stack_size: 1024,
        }
    }
}

impl ClusterConfig {
    /// Creates a new cluster configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Total stack bytes needed for one call.
    pub fn stack_bytes(&self) -> usize {
        self.master_stack_size + self.slave_stack_size * self.nb_pe.saturating_sub(1) as usize
    }
}

/// Builder for cluster call configuration.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Sets the number of processing elements taking part in the call.
    pub fn nb_pe(mut self, nb_pe: u32) -> Self {
        self.config.nb_pe = nb_pe.max(1);
        self
    }

    /// Sets the stack size of PE 0.
    pub fn master_stack_size(mut self, size: usize) -> Self {
        self.config.master_stack_size = size;
        self
    }

    /// Sets the stack size of every other PE.
    pub fn slave_stack_size(mut self, size: usize) -> Self {
        self.config.slave_stack_size = size;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ClusterConfig {
        self.config
    }
}

/// What a peripheral channel does after a transfer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Report the error and keep arming queued copies.
    #[default]
    Continue,
    /// Report the error and stop arming until the channel is resumed.
    Halt,
}
