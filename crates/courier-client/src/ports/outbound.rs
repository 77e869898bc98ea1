//! Driven Ports (SPI - Outbound Dependencies)
//!
//! The bus client depends on two collaborators it does not implement: the
//! queue transport ([`QueueFactory`]) and the host's identity
//! ([`HostIdentity`]).

pub use shared_bus::{Queue, QueueFactory, QueueMode, TransportError};

/// Identity of the running host and process.
pub trait HostIdentity: Send + Sync {
    /// Name of this machine, compared to detect same-host delivery.
    fn machine_name(&self) -> String;

    /// Name of this process, the default service name.
    fn process_name(&self) -> String;
}

/// Host identity from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHostIdentity;

impl HostIdentity for SystemHostIdentity {
    fn machine_name(&self) -> String {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn process_name(&self) -> String {
        std::env::current_exe()
            .ok()
            .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "courier".to_string())
    }
}

/// Fixed host identity, for tests and for hosts that know their names.
#[derive(Debug, Clone)]
pub struct StaticHostIdentity {
    pub machine_name: String,
    pub process_name: String,
}

impl StaticHostIdentity {
    pub fn new(machine_name: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            process_name: process_name.into(),
        }
    }
}

impl HostIdentity for StaticHostIdentity {
    fn machine_name(&self) -> String {
        self.machine_name.clone()
    }

    fn process_name(&self) -> String {
        self.process_name.clone()
    }
}
