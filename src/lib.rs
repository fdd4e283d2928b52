//! A host-side engine for Media Transfer Protocol (MTP) devices: session
//! and transaction management over USB, the typed object/property codec,
//! and a filesystem view that exposes device storage as a lazily-cached
//! directory tree.

use thiserror::Error;

mod command;
mod data;
mod event;
mod fs;
mod object;
mod response;
mod session;
mod storage;
mod transport;

pub use crate::command::*;
pub use crate::data::{parse_ptp_date, PtpData, PtpRead, PtpWrite};
pub use crate::event::*;
pub use crate::fs::{
    Attr, FsError, FsView, Node, StatFs, INVALID_FILE_HANDLE, ROOT_FILE_HANDLE, ROOT_STORAGE_ID,
};
pub use crate::object::{DeviceInfo, FormData, MtpProperty, ObjectInfo, StorageInfo, OBJECT_PROP_NAME};
pub use crate::response::*;
pub use crate::session::{Device, EventRequestHandle};
pub use crate::storage::*;
pub use crate::transport::{find_device, RusbTransport, UsbTransport, CONTROL_TIMEOUT, DEFAULT_TIMEOUT};

#[cfg(test)]
pub use crate::transport::mock;

/// An error in an MTP session, transaction, or filesystem operation.
#[derive(Error, Debug)]
pub enum Error {
    /// PTP Responder returned a status code other than Ok, either a
    /// constant in StandardResponseCode or a vendor-defined code
    #[error("the ptp device returned an error code: {0:?}")]
    Response(ResponseCode),

    /// Data received was malformed
    #[error("the data received was malformed: {0}")]
    Malformed(String),

    #[error("the data received was malformed: bad object format")]
    BadObjectFormat,

    #[error("the data received was malformed: bad association code")]
    BadAssociationCode,

    #[error("the data received was malformed: bad event code")]
    BadEventCode,

    #[error("received an event with no payload")]
    NoEventPayload,

    /// Another rusb error
    #[error("a usb error occurred: {0}")]
    Usb(#[from] rusb::Error),

    /// Another IO error
    #[error("an i/o error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("no mtp session is open")]
    NoSession,

    #[error("multiple matching devices found; a serial number is required")]
    MultipleDevices,

    #[error("another event request is already in flight")]
    EventRequestBusy,

    #[error("filesystem operation failed: {0:?}")]
    Fs(FsError),
}
