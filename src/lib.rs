//! DualPI2 — the dual-queue coupled AQM of [RFC 9332].
//!
//! Two FIFO bands share one byte pool: Classic traffic is governed by a PI²
//! controller dropping with the squared base probability, while L4S traffic
//! (ECT(1)/CE) gets shallow-threshold CE marking coupled to the same
//! controller, so scalable and Classic flows converge to the same rate. A
//! pending-dequeue protocol lets an aggregating downstream (e.g. Wi-Fi
//! A-MPDU) pre-commit a byte batch and still receive coherent marks.
//!
//! [`DualPi2QueueDisc`] is the synchronous state machine; [`cell`] wraps it
//! in an ingress/egress pair driven by a tokio event loop.
//!
//! [RFC 9332]: https://datatracker.ietf.org/doc/html/rfc9332

pub mod cell;
pub mod disc;
pub mod error;
pub mod packet;
pub mod queue;
pub mod trace;

pub use cell::{
    ControlInterface, DualPi2Cell, DualPi2CellControlInterface, DualPi2CellEgress,
    DualPi2CellIngress, Egress, Ingress, NeverStopped, TxQueueState,
};
pub use disc::{DualPi2Config, DualPi2QueueDisc, WIFI_FRAME_OVERHEAD};
pub use error::{Error, Result};
pub use packet::{Ecn, Packet, StdPacket};
pub use trace::{Band, DropReason, DualPi2Stats, DualPi2Trace, NullTrace, ProbSample};
