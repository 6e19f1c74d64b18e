//! Kernel session: wire protocol, worker lifecycle, and the correlation
//! bridge the engine dispatches through.

pub mod bridge;
pub mod protocol;
pub mod stub;
pub mod worker;

pub use bridge::{BridgeStats, KernelBridge, KernelCtx};
pub use protocol::{CorrelationId, KernelFault, KernelRequest, KernelResponse};
pub use stub::StubKernel;
pub use worker::{InProcessWorkerFactory, KernelService, WorkerFactory, WorkerHandle};
