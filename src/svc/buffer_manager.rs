use crate::buffer::BufferManager;
use crate::component::{Component, ComponentKind, PortContext};
use crate::port::{InvocationMode, PortArgs, PortError, PortResult, PortSpec, PortType};
use std::sync::Arc;
use tracing::warn;

/// Port face of a [`BufferManager`]. Both inputs are guarded and accept any
/// number of producers on index 0.
pub struct BufferManagerComponent {
    manager: Arc<BufferManager>,
}

impl BufferManagerComponent {
    pub const BUFFER_GET_CALLEE: usize = 0;
    pub const BUFFER_SEND_IN: usize = 1;

    pub fn new(manager: Arc<BufferManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }
}

impl Component for BufferManagerComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Passive
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("bufferGetCallee", PortType::BufferGet, InvocationMode::Guarded)
                .multi_producer(),
            PortSpec::input("bufferSendIn", PortType::Buffer, InvocationMode::Guarded)
                .multi_producer(),
        ]
    }

    fn handle(
        &mut self,
        ctx: &PortContext<'_>,
        port: usize,
        _index: usize,
        args: PortArgs,
    ) -> PortResult {
        match (port, args) {
            (Self::BUFFER_GET_CALLEE, PortArgs::BufferGet { size }) => {
                let buffer = self.manager.allocate(size)?;
                Ok(Some(PortArgs::Buffer(buffer)))
            }
            (Self::BUFFER_SEND_IN, PortArgs::Buffer(buffer)) => {
                if let Err(e) = self.manager.deallocate(buffer) {
                    warn!(instance = ctx.name(), error = %e, "buffer return refused");
                    return Err(PortError::Buffer(e));
                }
                Ok(None)
            }
            _ => Err(PortError::Unhandled { port: "bufferManager" }),
        }
    }

    fn teardown(&mut self, _ctx: &PortContext<'_>) {
        self.manager.teardown();
    }
}

/// Asks the manager behind output `port` for `size` bytes.
pub fn request_buffer(
    ctx: &PortContext<'_>,
    port: usize,
    size: usize,
) -> Result<crate::buffer::Buffer, PortError> {
    match ctx.invoke(port, 0, PortArgs::BufferGet { size })? {
        Some(PortArgs::Buffer(buffer)) => Ok(buffer),
        _ => Err(PortError::UnexpectedReply { port: "bufferGet" }),
    }
}
