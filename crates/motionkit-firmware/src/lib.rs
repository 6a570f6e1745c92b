//! # MotionKit Firmware
//!
//! Firmware image handling and transfer for the controller nodes on the
//! robot's message bus.
//!
//! - [`hex`]: Intel HEX record parsing
//! - [`chunks`]: grouping records into contiguous chunks
//! - [`bus`]: node addressing, update messages and the bus abstraction
//! - [`update`]: initiate, erase, download and the concurrent runner
//! - [`manifest`]: available firmware and per-node update checks

pub mod bus;
pub mod chunks;
pub mod error;
pub mod hex;
pub mod manifest;
pub mod update;

pub use bus::{
    Arrival, DataPayload, ErrorCode, Message, MessageBus, NodeBehavior, NodeId, SimulatedBus,
    DATA_PAYLOAD_SIZE,
};
pub use chunks::{Chunk, Chunks, HexRecordProcessor};
pub use error::{BusError, HexError, UpdateError};
pub use hex::{parse_line, HexRecord, HexRecordParser, RecordType};
pub use manifest::{
    check_firmware_updates, load_firmware_manifest, DeviceInfo, FirmwareManifest,
    FirmwareUpdateType, UpdateInfo,
};
pub use update::{
    run_updates, TargetLink, UpdatePhase, UpdateSettings, UpdateStatus, UpdateStream,
};
