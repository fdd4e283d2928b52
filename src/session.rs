#[cfg(feature = "serde")]
use serde::Serialize;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace, warn};
use num_derive::FromPrimitive;
use num_traits::{FromPrimitive, ToPrimitive};

use std::cmp::min;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{CommandCode, MtpExtCommandCode, StandardCommandCode};
use crate::data::{PtpData, PtpRead};
use crate::event::Event;
use crate::object::{DeviceInfo, MtpProperty, ObjectInfo, StorageInfo};
use crate::response::{ResponseCode, StandardResponseCode};
use crate::storage::{ObjectFormatCode, ObjectHandle, StorageId};
use crate::transport::{UsbTransport, DEFAULT_TIMEOUT};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

#[derive(Debug, Clone)]
struct ContainerInfo {
    /// payload len in bytes, usually relevant for data phases
    payload_len: usize,
    kind: ContainerType,
    /// StandardCommandCode or ResponseCode, depending on `kind`
    code: u16,
    tid: u32,
}

const CONTAINER_HEADER_SIZE: usize = 12;

impl ContainerInfo {
    fn parse<R: ReadBytesExt>(mut r: R) -> Result<ContainerInfo, Error> {
        let len = r.read_u32::<LittleEndian>()?;
        let kind_u16 = r.read_u16::<LittleEndian>()?;
        let kind = ContainerType::from_u16(kind_u16)
            .ok_or_else(|| Error::Malformed(format!("invalid container type {:x}", kind_u16)))?;
        let code = r.read_u16::<LittleEndian>()?;
        let tid = r.read_u32::<LittleEndian>()?;

        Ok(ContainerInfo {
            payload_len: (len as usize).saturating_sub(CONTAINER_HEADER_SIZE),
            kind,
            code,
            tid,
        })
    }

    fn belongs_to(&self, tid: u32) -> bool {
        self.tid == tid
    }
}

/// Whether a device accepts a command's header and payload in one bulk
/// write, or requires them split on the endpoint's max packet size. Probed
/// on the first data phase and cached for the life of the `Device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketDivisionMode {
    Undefined,
    FirstPacketOnly,
    SplitOnMaxPacketSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    SessionOpening,
    SessionOpen,
}

/// An in-flight `submit_event_request` the caller can reap or discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventRequestHandle(u32);

struct SendObjectInfoPairing {
    tid: u32,
    handle: ObjectHandle,
}

/// Owns a claimed MTP interface and drives the session/transaction protocol
/// over a [`UsbTransport`]. Every public operation serializes through a
/// single transaction mutex; events use a separate mutex over the
/// interrupt endpoint so command traffic and event traffic never share an
/// in-flight transfer.
pub struct Device<T: UsbTransport> {
    transport: T,
    current_tid: AtomicU32,
    txn_lock: Mutex<()>,
    event_lock: Mutex<()>,
    session_state: Mutex<SessionState>,
    packet_division_mode: Mutex<PacketDivisionMode>,
    last_send_object_info: Mutex<Option<SendObjectInfoPairing>>,
    event_request: Mutex<Option<EventRequestHandle>>,
    next_event_request_id: AtomicU32,
}

impl<T: UsbTransport> Device<T> {
    pub fn new(transport: T) -> Device<T> {
        Device {
            transport,
            current_tid: AtomicU32::new(0),
            txn_lock: Mutex::new(()),
            event_lock: Mutex::new(()),
            session_state: Mutex::new(SessionState::Closed),
            packet_division_mode: Mutex::new(PacketDivisionMode::Undefined),
            last_send_object_info: Mutex::new(None),
            event_request: Mutex::new(None),
            next_event_request_id: AtomicU32::new(1),
        }
    }

    fn require_session(&self) -> Result<(), Error> {
        if *self.session_state.lock().unwrap() != SessionState::SessionOpen {
            return Err(Error::NoSession);
        }
        Ok(())
    }

    /// Executes one MTP transaction: command phase, optional outbound data
    /// phase, then the inbound data/response phases. Every call acquires
    /// the transaction mutex for its entire duration.
    fn command(
        &self,
        code: CommandCode,
        params: &[u32],
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let _guard = self.txn_lock.lock().unwrap();

        let tid = self.current_tid.fetch_add(1, Ordering::AcqRel);

        let mut request_payload = Vec::with_capacity(params.len() * 4);
        for p in params {
            request_payload.write_u32::<LittleEndian>(*p).ok();
        }

        self.write_txn_phase(ContainerType::Command, code, tid, &request_payload, timeout)?;

        if let Some(data) = data {
            self.write_txn_phase(ContainerType::Data, code, tid, data, timeout)?;
        }

        let mut data_phase_payload = vec![];
        loop {
            let (container, payload) = match self.read_txn_phase_bulk(timeout) {
                Ok(v) => v,
                Err(Error::Usb(rusb::Error::Pipe)) => {
                    warn!("stall on transaction {}, clearing halt", tid);
                    self.transport.clear_stall_in().ok();
                    self.transport.clear_stall_out().ok();
                    return Err(rusb::Error::Pipe.into());
                }
                Err(e) => return Err(e),
            };

            if !container.belongs_to(tid) {
                return Err(Error::Malformed(format!(
                    "mismatched txnid {}, expecting {}",
                    container.tid, tid
                )));
            }

            match container.kind {
                ContainerType::Data => {
                    data_phase_payload = payload;
                }
                ContainerType::Response => {
                    let code = ResponseCode::from_u16(container.code).unwrap();
                    if code != ResponseCode::Standard(StandardResponseCode::Ok) {
                        return Err(Error::Response(code));
                    }
                    return Ok(data_phase_payload);
                }
                _ => {}
            }
        }
    }

    fn write_txn_phase(
        &self,
        kind: ContainerType,
        code: CommandCode,
        tid: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        trace!("write {:?} - 0x{1:04x} ({1:?}), tid:{2}", kind, code, tid);

        let mode = *self.packet_division_mode.lock().unwrap();

        if kind == ContainerType::Data && mode == PacketDivisionMode::SplitOnMaxPacketSize {
            return self.write_txn_phase_split(kind, code, tid, payload, timeout);
        }

        const CHUNK_SIZE: usize = 1024 * 1024;

        let first_chunk_payload_bytes = min(payload.len(), CHUNK_SIZE - CONTAINER_HEADER_SIZE);
        let mut buf = Vec::with_capacity(first_chunk_payload_bytes + CONTAINER_HEADER_SIZE);
        buf.write_u32::<LittleEndian>((payload.len() + CONTAINER_HEADER_SIZE) as u32)
            .ok();
        buf.write_u16::<LittleEndian>(kind as u16).ok();
        buf.write_u16::<LittleEndian>(code.to_u16().unwrap()).ok();
        buf.write_u32::<LittleEndian>(tid).ok();
        buf.extend_from_slice(&payload[..first_chunk_payload_bytes]);

        let wrote_whole = self.transport.bulk_write(&buf, timeout)? == buf.len();

        if kind == ContainerType::Data && mode == PacketDivisionMode::Undefined {
            let mut mode_guard = self.packet_division_mode.lock().unwrap();
            *mode_guard = if wrote_whole {
                PacketDivisionMode::FirstPacketOnly
            } else {
                PacketDivisionMode::SplitOnMaxPacketSize
            };
        }

        for chunk in payload[first_chunk_payload_bytes..].chunks(CHUNK_SIZE) {
            self.transport.bulk_write(chunk, timeout)?;
        }

        Ok(())
    }

    /// Writes the container header as its own transfer, then the payload in
    /// `wMaxPacketSize`-bounded chunks. Used once a device is found (via the
    /// probe in `write_txn_phase`) not to accept the header and a large data
    /// phase combined in a single bulk transfer.
    fn write_txn_phase_split(
        &self,
        kind: ContainerType,
        code: CommandCode,
        tid: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut header = Vec::with_capacity(CONTAINER_HEADER_SIZE);
        header
            .write_u32::<LittleEndian>((payload.len() + CONTAINER_HEADER_SIZE) as u32)
            .ok();
        header.write_u16::<LittleEndian>(kind as u16).ok();
        header.write_u16::<LittleEndian>(code.to_u16().unwrap()).ok();
        header.write_u32::<LittleEndian>(tid).ok();
        self.transport.bulk_write(&header, timeout)?;

        let max_packet = self.transport.out_max_packet_size().max(1);
        for chunk in payload.chunks(max_packet) {
            self.transport.bulk_write(chunk, timeout)?;
        }

        Ok(())
    }

    fn read_txn_phase_bulk(&self, timeout: Duration) -> Result<(ContainerInfo, Vec<u8>), Error> {
        const BUF_SIZE: usize = 8192;
        let mut buf = vec![0u8; BUF_SIZE];
        let n = self.transport.bulk_read(&mut buf, timeout)?;
        let buf = &buf[..n];

        let cinfo = ContainerInfo::parse(&buf[..CONTAINER_HEADER_SIZE.min(buf.len())])?;
        trace!("container {:?}", cinfo);

        if cinfo.payload_len == 0 {
            return Ok((cinfo, vec![]));
        }

        let mut payload = Vec::with_capacity(cinfo.payload_len + 1);
        payload.extend_from_slice(&buf[CONTAINER_HEADER_SIZE..]);

        if payload.len() < cinfo.payload_len || buf.len() == BUF_SIZE {
            const READ_BLOCK: usize = 1_048_576;
            loop {
                let mut chunk = vec![0u8; READ_BLOCK];
                let n = self.transport.bulk_read(&mut chunk, timeout)?;
                payload.extend_from_slice(&chunk[..n]);
                trace!("  bulk rx {}, ({}/{})", n, payload.len(), cinfo.payload_len);
                if n < READ_BLOCK || payload.len() >= cinfo.payload_len {
                    break;
                }
            }
        }

        Ok((cinfo, payload))
    }

    fn read_txn_phase_interrupt(
        &self,
        timeout: Duration,
    ) -> Result<(ContainerInfo, Vec<u8>), Error> {
        let mut buf = [0u8; 64];
        let n = self.transport.interrupt_read(&mut buf, timeout)?;
        let buf = &buf[..n];

        let cinfo = ContainerInfo::parse(&buf[..CONTAINER_HEADER_SIZE.min(buf.len())])?;
        trace!("event container {:?}", cinfo);

        if cinfo.payload_len == 0 {
            warn!("received interrupt data with no payload");
            return Err(Error::NoEventPayload);
        }

        let mut payload = Vec::with_capacity(cinfo.payload_len);
        payload.extend_from_slice(&buf[CONTAINER_HEADER_SIZE..]);

        Ok((cinfo, payload))
    }

    // --- session lifecycle -------------------------------------------------

    pub fn open_session(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let mut state = self.session_state.lock().unwrap();
        if *state == SessionState::SessionOpen {
            return Ok(());
        }
        *state = SessionState::SessionOpening;
        drop(state);

        let session_id = 1;
        let result = self.command(
            StandardCommandCode::OpenSession.into(),
            &[session_id, 0, 0],
            None,
            timeout,
        );

        let mut state = self.session_state.lock().unwrap();
        match result {
            Ok(_) => {
                *state = SessionState::SessionOpen;
                debug!("session opened");
                Ok(())
            }
            Err(Error::Response(ResponseCode::Standard(
                StandardResponseCode::SessionAlreadyOpen,
            ))) => {
                *state = SessionState::SessionOpen;
                Ok(())
            }
            Err(e) => {
                *state = SessionState::Closed;
                Err(e)
            }
        }
    }

    pub fn close_session(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.command(StandardCommandCode::CloseSession.into(), &[], None, timeout)?;
        *self.session_state.lock().unwrap() = SessionState::Closed;
        debug!("session closed");
        Ok(())
    }

    pub fn reset(&self) -> Result<(), Error> {
        self.transport.reset()
    }

    // --- discovery -----------------------------------------------------

    pub fn get_device_info(&self, timeout: Option<Duration>) -> Result<DeviceInfo, Error> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetDeviceInfo.into(),
            &[0, 0, 0],
            None,
            timeout,
        )?;

        let device_info = DeviceInfo::decode(&data)?;
        debug!("device_info {:?}", device_info);
        Ok(device_info)
    }

    pub fn get_storage_ids(&self, timeout: Option<Duration>) -> Result<Vec<StorageId>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetStorageIDs.into(),
            &[],
            None,
            timeout,
        )?;

        let mut cur = Cursor::new(data);
        let value = cur.read_ptp_u32_vec()?;
        cur.expect_end()?;

        Ok(value.into_iter().map(StorageId::from_raw).collect())
    }

    pub fn get_storage_info(
        &self,
        storage_id: StorageId,
        timeout: Option<Duration>,
    ) -> Result<StorageInfo, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetStorageInfo.into(),
            &[storage_id.raw()],
            None,
            timeout,
        )?;

        let mut cur = Cursor::new(data);
        let res = StorageInfo::decode(&mut cur)?;
        cur.expect_end()?;
        Ok(res)
    }

    // --- traversal -------------------------------------------------------

    pub fn get_object_info(
        &self,
        handle: ObjectHandle,
        timeout: Option<Duration>,
    ) -> Result<ObjectInfo, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetObjectInfo.into(),
            &[handle.raw()],
            None,
            timeout,
        )?;
        Ok(ObjectInfo::decode(&data)?)
    }

    /// Gets the object handles contained in a storage. `storage` of
    /// `StorageId::all_for_handles()` (the wire value `0`) means every
    /// storage; `format` of `None` means every format; `parent` of `None`
    /// defaults to the protocol sentinel meaning "every object in the
    /// storage" rather than just the top level.
    pub fn get_object_handles(
        &self,
        storage: StorageId,
        format: Option<ObjectFormatCode>,
        parent: Option<ObjectHandle>,
        timeout: Option<Duration>,
    ) -> Result<Vec<ObjectHandle>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetObjectHandles.into(),
            &[
                storage.raw(),
                format.map_or(0x0, |fmt| fmt.to_u32().unwrap()),
                parent.map_or(0x0, |p| p.raw()),
            ],
            None,
            timeout,
        )?;

        let mut cur = Cursor::new(data);
        let value = cur.read_ptp_u32_vec()?;
        cur.expect_end()?;

        Ok(value.into_iter().map(ObjectHandle::from_raw).collect())
    }

    pub fn get_num_objects(
        &self,
        storage_id: Option<StorageId>,
        format: Option<ObjectFormatCode>,
        parent: Option<ObjectHandle>,
        timeout: Option<Duration>,
    ) -> Result<u32, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetNumObjects.into(),
            &[
                storage_id.unwrap_or_else(StorageId::all).raw(),
                format.map_or(0x0, |fmt| fmt.to_u32().unwrap()),
                parent.map_or(0x0, |oh| oh.raw()),
            ],
            None,
            timeout,
        )?;

        let mut cur = Cursor::new(data);
        let value = cur.read_ptp_u32()?;
        cur.expect_end()?;
        Ok(value)
    }

    // --- data ------------------------------------------------------------

    pub fn send_object_info(
        &self,
        storage: StorageId,
        parent: ObjectHandle,
        info: &ObjectInfo,
        timeout: Option<Duration>,
    ) -> Result<ObjectHandle, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let mut data = vec![];
        info.encode(&mut data)?;

        let tid_before = self.current_tid.load(Ordering::Acquire);
        let data = self.command(
            StandardCommandCode::SendObjectInfo.into(),
            &[storage.raw(), parent.raw()],
            Some(&data[..]),
            timeout,
        )?;

        let mut cur = Cursor::new(data);
        let _storage_id = cur.read_ptp_u32()?;
        let _parent_handle = cur.read_ptp_u32()?;
        let object_handle = ObjectHandle::from_raw(cur.read_ptp_u32()?);
        cur.expect_end()?;

        *self.last_send_object_info.lock().unwrap() = Some(SendObjectInfoPairing {
            tid: tid_before,
            handle: object_handle,
        });

        Ok(object_handle)
    }

    /// Uploads object data. Only valid immediately following a successful
    /// `send_object_info` in the same session; MTP pairs the two
    /// transactions by adjacency, not by an explicit handle parameter.
    pub fn send_object(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);

        if self.last_send_object_info.lock().unwrap().is_none() {
            return Err(Error::Response(ResponseCode::Standard(
                StandardResponseCode::InvalidParameter,
            )));
        }

        let result = self.command(
            StandardCommandCode::SendObject.into(),
            &[],
            Some(data),
            timeout,
        );

        *self.last_send_object_info.lock().unwrap() = None;
        result.map(|_| ())
    }

    pub fn get_object(
        &self,
        handle: ObjectHandle,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.command(
            StandardCommandCode::GetObject.into(),
            &[handle.raw()],
            None,
            timeout,
        )
    }

    pub fn get_partial_object(
        &self,
        handle: ObjectHandle,
        offset: u32,
        len: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.command(
            StandardCommandCode::GetPartialObject.into(),
            &[handle.raw(), offset, len],
            None,
            timeout,
        )
    }

    /// MTP vendor-extension 64-bit partial read (`0x95C1`): offset is
    /// split into low/high u32 parameters per the wire convention.
    pub fn get_partial_object_64(
        &self,
        handle: ObjectHandle,
        offset: u64,
        len: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.command(
            MtpExtCommandCode::GetPartialObject64.into(),
            &[handle.raw(), offset as u32, (offset >> 32) as u32, len],
            None,
            timeout,
        )
    }

    pub fn delete_object(
        &self,
        handle: ObjectHandle,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.command(
            StandardCommandCode::DeleteObject.into(),
            &[handle.raw(), 0],
            None,
            timeout,
        )?;
        Ok(())
    }

    // --- properties --------------------------------------------------------

    pub fn get_device_prop_desc(
        &self,
        code: u16,
        timeout: Option<Duration>,
    ) -> Result<MtpProperty, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            StandardCommandCode::GetDevicePropDesc.into(),
            &[code as u32],
            None,
            timeout,
        )?;
        let mut cur = Cursor::new(data);
        MtpProperty::decode(&mut cur)
    }

    pub fn set_device_prop_value_str(
        &self,
        code: u16,
        value: &str,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let payload = PtpData::STR(value.to_owned()).encode();
        self.command(
            StandardCommandCode::SetDevicePropValue.into(),
            &[code as u32],
            Some(&payload),
            timeout,
        )?;
        Ok(())
    }

    pub fn get_object_props_supported(
        &self,
        format: ObjectFormatCode,
        timeout: Option<Duration>,
    ) -> Result<Vec<u16>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            MtpExtCommandCode::GetObjectPropsSupported.into(),
            &[format.to_u32().unwrap()],
            None,
            timeout,
        )?;
        let mut cur = Cursor::new(data);
        let value = cur.read_ptp_u16_vec()?;
        cur.expect_end()?;
        Ok(value)
    }

    pub fn get_object_prop_desc(
        &self,
        code: u16,
        format: ObjectFormatCode,
        timeout: Option<Duration>,
    ) -> Result<MtpProperty, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let data = self.command(
            MtpExtCommandCode::GetObjectPropDesc.into(),
            &[code as u32, format.to_u32().unwrap()],
            None,
            timeout,
        )?;
        let mut cur = Cursor::new(data);
        MtpProperty::decode(&mut cur)
    }

    pub fn get_object_prop_value(
        &self,
        handle: ObjectHandle,
        code: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.command(
            MtpExtCommandCode::GetObjectPropValue.into(),
            &[handle.raw(), code as u32],
            None,
            timeout,
        )
    }

    pub fn set_object_prop_value(
        &self,
        handle: ObjectHandle,
        code: u16,
        value: &PtpData,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.require_session()?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let payload = value.encode();
        self.command(
            MtpExtCommandCode::SetObjectPropValue.into(),
            &[handle.raw(), code as u32],
            Some(&payload),
            timeout,
        )?;
        Ok(())
    }

    // --- events --------------------------------------------------------

    /// Marks an event request as pending. Only one may be in flight at a
    /// time; a second call before `reap_event_request`/`discard_event_request`
    /// fails with `Error::EventRequestBusy`.
    pub fn submit_event_request(&self) -> Result<EventRequestHandle, Error> {
        let mut slot = self.event_request.lock().unwrap();
        if slot.is_some() {
            return Err(Error::EventRequestBusy);
        }
        let id = self.next_event_request_id.fetch_add(1, Ordering::AcqRel);
        let handle = EventRequestHandle(id);
        *slot = Some(handle);
        Ok(handle)
    }

    /// Blocks on the interrupt endpoint until an event arrives, the
    /// request is discarded (`Ok(None)`), or `timeout` elapses.
    pub fn reap_event_request(
        &self,
        handle: EventRequestHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Event>, Error> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let _guard = self.event_lock.lock().unwrap();

        if *self.event_request.lock().unwrap() != Some(handle) {
            return Ok(None);
        }

        loop {
            if *self.event_request.lock().unwrap() != Some(handle) {
                return Ok(None);
            }

            let (container, payload) = match self.read_txn_phase_interrupt(timeout) {
                Ok(v) => v,
                Err(Error::Usb(rusb::Error::Timeout)) => return Ok(None),
                Err(e) => return Err(e),
            };

            trace!("event tid: {}", container.tid);

            if container.kind == ContainerType::Event {
                *self.event_request.lock().unwrap() = None;
                return Event::new(container.code, payload.as_ref()).map(Some);
            }
        }
    }

    pub fn discard_event_request(&self, handle: EventRequestHandle) {
        let mut slot = self.event_request.lock().unwrap();
        if *slot == Some(handle) {
            *slot = None;
        }
    }

    /// Best-effort single event poll, used outside the submit/reap pairing
    /// by callers that just want "is anything pending right now".
    pub fn poll_event(&self, timeout: Option<Duration>) -> Result<Option<Event>, Error> {
        let timeout = timeout.unwrap_or(Duration::from_millis(0));
        let _guard = self.event_lock.lock().unwrap();
        match self.read_txn_phase_interrupt(timeout) {
            Ok((container, payload)) if container.kind == ContainerType::Event => {
                Event::new(container.code, payload.as_ref()).map(Some)
            }
            Ok(_) => Ok(None),
            Err(Error::Usb(rusb::Error::Timeout)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PtpWrite;
    use crate::storage::{AssociationCode, StandardAssociationCode, StandardObjectFormatCode};
    use crate::transport::mock::{self, MockResponse, MockTransport};
    use std::sync::Arc;

    const OK: u16 = 0x2001;

    fn sample_device_info_bytes(extra_ops: &[u16]) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_ptp_u16(100).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u16(0).unwrap();
        buf.write_ptp_str("").unwrap();
        buf.write_ptp_u16(0).unwrap();
        let mut ops = vec![0x1001u16, 0x1002];
        ops.extend_from_slice(extra_ops);
        buf.write_ptp_u16_vec(&ops).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_u16_vec(&[]).unwrap();
        buf.write_ptp_str("Acme").unwrap();
        buf.write_ptp_str("Widget").unwrap();
        buf.write_ptp_str("1.0").unwrap();
        buf.write_ptp_str("SN123").unwrap();
        buf
    }

    fn sample_object_info(name: &str) -> ObjectInfo {
        ObjectInfo {
            storage_id: 1,
            object_format: ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage),
            protection_status: 0,
            object_compressed_size: 0,
            thumb_format: ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage),
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: 0xFFFFFFFF,
            association_type: AssociationCode::Standard(StandardAssociationCode::Undefined),
            association_desc: 0,
            sequence_number: 0,
            filename: name.to_owned(),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
        }
    }

    #[test]
    fn get_device_info_round_trips_through_the_container_codec() {
        let payload = sample_device_info_bytes(&[0x95C1]);
        let transport = MockTransport::scripted(vec![
            MockResponse::Bulk(mock::container(2, 0x1001, 0, &payload)),
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
        ]);
        let device = Device::new(transport);
        let info = device.get_device_info(None).unwrap();
        assert_eq!(info.manufacturer, "Acme");
        assert_eq!(info.model, "Widget");
        assert_eq!(info.serial_number, "SN123");
        assert!(info.supports_partial_object_64());
    }

    #[test]
    fn transaction_ids_increment_monotonically() {
        let transport = MockTransport::scripted(vec![
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
            MockResponse::Bulk(mock::container(3, OK, 1, &[])),
        ]);
        let device = Device::new(transport);
        device.open_session(None).unwrap();
        device.close_session(None).unwrap();
    }

    #[test]
    fn concurrent_calls_serialize_through_the_transaction_mutex() {
        let payload = sample_device_info_bytes(&[]);
        let transport = MockTransport::scripted(vec![
            MockResponse::Bulk(mock::container(2, 0x1001, 0, &payload)),
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
            MockResponse::Bulk(mock::container(2, 0x1001, 1, &payload)),
            MockResponse::Bulk(mock::container(3, OK, 1, &[])),
        ]);
        let device = Arc::new(Device::new(transport));
        let d1 = device.clone();
        let d2 = device.clone();
        let t1 = std::thread::spawn(move || d1.get_device_info(None).unwrap());
        let t2 = std::thread::spawn(move || d2.get_device_info(None).unwrap());
        t1.join().unwrap();
        t2.join().unwrap();
    }

    #[test]
    fn stall_clears_halts_and_surfaces_the_error_without_retrying() {
        let transport = MockTransport::scripted(vec![MockResponse::Stall]);
        let device = Device::new(transport);
        let err = device.get_device_info(None).unwrap_err();
        assert!(matches!(err, Error::Usb(rusb::Error::Pipe)));
    }

    #[test]
    fn send_object_requires_a_preceding_send_object_info() {
        let transport =
            MockTransport::scripted(vec![MockResponse::Bulk(mock::container(3, OK, 0, &[]))]);
        let device = Device::new(transport);
        device.open_session(None).unwrap();

        let err = device.send_object(b"data", None).unwrap_err();
        assert!(matches!(
            err,
            Error::Response(ResponseCode::Standard(StandardResponseCode::InvalidParameter))
        ));
    }

    #[test]
    fn send_object_info_then_send_object_pairs_across_transactions() {
        let mut resp_payload = vec![];
        resp_payload.write_ptp_u32(1).unwrap();
        resp_payload.write_ptp_u32(0xFFFFFFFF).unwrap();
        resp_payload.write_ptp_u32(42).unwrap();

        let transport = MockTransport::scripted(vec![
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
            MockResponse::Bulk(mock::container(2, 0x100C, 1, &resp_payload)),
            MockResponse::Bulk(mock::container(3, OK, 1, &[])),
            MockResponse::Bulk(mock::container(3, OK, 2, &[])),
        ]);
        let device = Device::new(transport);
        device.open_session(None).unwrap();

        let info = sample_object_info("foo.txt");
        let handle = device
            .send_object_info(StorageId::from_raw(1), ObjectHandle::root(), &info, None)
            .unwrap();
        assert_eq!(handle.raw(), 42);

        device.send_object(b"hello world", None).unwrap();
    }

    #[test]
    fn event_request_submit_reap_round_trip() {
        let mut params = vec![];
        params.extend_from_slice(&7u32.to_le_bytes());
        let transport = MockTransport::scripted(vec![MockResponse::Interrupt(mock::container(
            4, 0x4002, 0, &params,
        ))]);
        let device = Device::new(transport);

        let handle = device.submit_event_request().unwrap();
        let event = device.reap_event_request(handle, None).unwrap().unwrap();
        assert_eq!(event.params, vec![7]);
    }

    #[test]
    fn submit_event_request_rejects_a_second_in_flight_request() {
        let transport = MockTransport::scripted(vec![]);
        let device = Device::new(transport);
        let _first = device.submit_event_request().unwrap();
        let err = device.submit_event_request().unwrap_err();
        assert!(matches!(err, Error::EventRequestBusy));
    }

    #[test]
    fn discarding_an_event_request_makes_reap_return_none_without_touching_the_transport() {
        let transport = MockTransport::scripted(vec![]);
        let device = Device::new(transport);
        let handle = device.submit_event_request().unwrap();
        device.discard_event_request(handle);
        assert!(device.reap_event_request(handle, None).unwrap().is_none());
    }

    #[test]
    fn write_txn_phase_switches_to_packet_split_writes_once_probed() {
        let mut resp_payload = vec![];
        resp_payload.write_ptp_u32(1).unwrap();
        resp_payload.write_ptp_u32(0xFFFFFFFF).unwrap();
        resp_payload.write_ptp_u32(42).unwrap();

        let transport = Arc::new(MockTransport::scripted(vec![
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
            MockResponse::Bulk(mock::container(2, 0x100C, 1, &resp_payload)),
            MockResponse::Bulk(mock::container(3, OK, 1, &[])),
            MockResponse::Bulk(mock::container(3, OK, 2, &[])),
        ]));
        let device = Device::new(transport.clone());
        device.open_session(None).unwrap();

        // Command phase of send_object_info is a 12-byte header plus two
        // u32 params, 20 bytes total; force the data phase (header plus the
        // encoded ObjectInfo, comfortably longer) short so the probe
        // concludes the device needs split transfers, leaving the smaller
        // command phase write untouched.
        transport.force_short_next_write(20);
        let info = sample_object_info("big.bin");
        device
            .send_object_info(StorageId::from_raw(1), ObjectHandle::root(), &info, None)
            .unwrap();

        let payload = vec![7u8; 2000];
        device.send_object(&payload, None).unwrap();

        let sent = transport.sent();
        // sent[0]: open_session command (tid 0)
        // sent[1]: send_object_info command phase (tid 1)
        // sent[2]: send_object_info data phase, forced short (tid 1)
        // sent[3]: send_object command phase (tid 2)
        // sent[4..]: send_object data phase, now split: header on its own,
        // payload chunked at the mock's 512-byte wMaxPacketSize.
        let header_write = &sent[4];
        assert_eq!(header_write.len(), 12);
        let chunks = &sent[5..];
        assert!(chunks.iter().all(|c| c.len() <= 512));
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), payload.len());
    }
}

