//! Firmware acquisition pipeline for the Samsung FUS service: session
//! handshake, download, CRC32/MD5 verification, key derivation and
//! decryption, driven one job at a time by [`JobController`].

pub mod crypto;
pub mod decrypt;
pub mod download;
pub mod error;
pub mod identifier;
pub mod job;
pub mod key;
pub mod progress;
pub mod session;
pub mod sink;
pub mod throughput;
pub mod verify;

pub use error::{ChecksumKind, Error, ErrorKind, Outcome};
pub use identifier::{FirmwareIdentifier, FwVersion};
pub use job::{Failure, Job, JobController, JobError, JobHandle, JobState};
pub use progress::{Phase, Progress, ProgressEvent, ProgressObserver};
pub use session::{BinaryFileInfo, FirmwareService, FirmwareSession, FusClient, FusClientBuilder};
pub use sink::{DownloadSink, FileStorage, StorageProvider};
