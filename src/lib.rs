//! vmseal: sealed VM disk-template builder.
//!
//! Turns a raw operating-system install image into a sealed, reusable
//! virtual-machine disk template: build a disk from the image, patch it
//! offline, boot a VM from it, establish a remote administrative session,
//! generalize the guest, and capture the disk — collecting diagnostic logs
//! at every stage.
//!
//! The library surface exists so tests (and embedders) can drive the
//! pipeline with their own [`hypervisor::Hypervisor`],
//! [`remoting::RemoteTransport`], and [`tools::ServicingTools`]
//! implementations; the `vmseal` binary wires in the real Windows-backed
//! ones.

pub mod hypervisor;
pub mod logging;
pub mod poll;
pub mod provision;
pub mod remoting;
pub mod tools;
