//! Worker runtime.
//!
//! - `txrx`: controller that spawns, releases and joins the workers.
//! - `worker`: the per-thread transmit/receive loop.
//! - `barrier`: startup gate between the controller and its workers.
//! - `clock`: per-frame arrival timestamps.
//! - `shutdown`: the shared running flag.
//! - `topology`: core pinning and radio partitioning.

pub mod barrier;
pub mod clock;
pub mod shutdown;
pub mod topology;
pub mod txrx;
pub mod worker;

pub use barrier::StartBarrier;
pub use clock::FrameClock;
pub use shutdown::RunFlag;
pub use txrx::{ComputeQueues, PacketTxRx};
pub use worker::{Poll, TxRxWorker, WorkerIo};
