use crate::component::{Component, ComponentKind, PortContext};
use crate::port::{InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalPolicy {
    /// Record and carry on.
    #[default]
    Log,
    /// Record and ask the deployment to stop cycling.
    Halt,
}

/// Receives FATAL announcements and applies the deployment's response.
pub struct FatalHandler {
    policy: FatalPolicy,
    halt: Arc<AtomicBool>,
    announced: Vec<String>,
}

impl FatalHandler {
    pub const FATAL_RECEIVE: usize = 0;

    pub fn new(policy: FatalPolicy, halt: Arc<AtomicBool>) -> Self {
        Self {
            policy,
            halt,
            announced: Vec::new(),
        }
    }

    pub fn announced(&self) -> &[String] {
        &self.announced
    }
}

impl Component for FatalHandler {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("FatalReceive", PortType::FatalAnnounce, InvocationMode::Guarded).multi_producer()]
    }

    fn handle(
        &mut self,
        _ctx: &PortContext<'_>,
        port: usize,
        _index: usize,
        args: PortArgs,
    ) -> PortResult {
        let (Self::FATAL_RECEIVE, PortArgs::FatalAnnounce { instance }) = (port, args) else {
            return Err(PortError::Unhandled { port: "FatalReceive" });
        };
        error!(instance = %instance, policy = ?self.policy, "fatal announced");
        if self.policy == FatalPolicy::Halt {
            self.halt.store(true, Ordering::Release);
        }
        self.announced.push(instance);
        Ok(None)
    }
}
