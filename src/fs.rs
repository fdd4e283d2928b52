use log::{debug, warn};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::object::{ObjectInfo, OBJECT_PROP_NAME};
use crate::response::{ResponseCode, StandardResponseCode};
use crate::storage::{
    AssociationCode, ObjectFormatCode, ObjectHandle, StandardAssociationCode,
    StandardObjectFormatCode, StorageId,
};
use crate::data::PtpData;
use crate::session::Device;
use crate::transport::UsbTransport;
use crate::Error;

/// Sentinel handle for the single synthetic filesystem root, which has no
/// MTP counterpart.
pub const ROOT_FILE_HANDLE: ObjectHandle = ObjectHandle::from_raw_const(0xFFFF_FFFE);

/// Parent of the root; never resolvable, exists so the lookup table can
/// give the root an entry like every other node.
pub const INVALID_FILE_HANDLE: ObjectHandle = ObjectHandle::from_raw_const(0xFFFF_FFFC);

/// Storage id carried by the synthetic root (it isn't really in any
/// storage).
pub const ROOT_STORAGE_ID: StorageId = StorageId::from_raw_const(0xFFFF_FFFF);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NoEntry,
    NotDir,
    NotEmpty,
    Invalid,
    NotSupported,
    Io,
    NoSpace,
}

fn map_engine_error(e: Error) -> Error {
    let fs_err = match &e {
        Error::Response(ResponseCode::Standard(StandardResponseCode::InvalidObjectHandle)) => {
            FsError::NoEntry
        }
        Error::Response(ResponseCode::Standard(StandardResponseCode::AccessDenied)) => {
            FsError::Invalid
        }
        Error::Response(ResponseCode::Standard(StandardResponseCode::StoreFull)) => {
            FsError::NoSpace
        }
        Error::Response(ResponseCode::Standard(StandardResponseCode::OperationNotSupported)) => {
            FsError::NotSupported
        }
        Error::Fs(_) => return e,
        _ => FsError::Io,
    };
    Error::Fs(fs_err)
}

/// A node in the lazily-populated filesystem tree. Extends `ObjectInfo`
/// with bookkeeping the device doesn't track: whether `children` is a
/// complete enumeration, whether the node has pending local edits, and
/// when it was last touched.
#[derive(Debug, Clone)]
pub struct Node {
    pub handle: ObjectHandle,
    pub storage_id: StorageId,
    pub info: ObjectInfo,
    pub children: Vec<ObjectHandle>,
    pub fetched: bool,
    pub modified: bool,
    pub accessed: SystemTime,
    /// Locally-set modification time, as written by `utimes`. `None` until
    /// `utimes` is called, in which case `getattr` falls back to the
    /// device-reported modification date.
    pub mtime: Option<SystemTime>,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.info.is_association()
    }
}

struct NodeLookup {
    storage_id: StorageId,
    parent: ObjectHandle,
}

fn synthetic_object_info(name: &str, parent: ObjectHandle, storage: StorageId, is_dir: bool) -> ObjectInfo {
    ObjectInfo {
        storage_id: storage.raw(),
        object_format: if is_dir {
            ObjectFormatCode::Standard(StandardObjectFormatCode::Association)
        } else {
            ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage)
        },
        protection_status: 0,
        object_compressed_size: 0,
        thumb_format: ObjectFormatCode::Standard(StandardObjectFormatCode::UndefinedNonImage),
        thumb_compressed_size: 0,
        thumb_pix_width: 0,
        thumb_pix_height: 0,
        image_pix_width: 0,
        image_pix_height: 0,
        image_bit_depth: 0,
        parent_object: parent.raw(),
        association_type: if is_dir {
            AssociationCode::Standard(StandardAssociationCode::GenericFolder)
        } else {
            AssociationCode::Standard(StandardAssociationCode::Undefined)
        },
        association_desc: 0,
        sequence_number: 0,
        filename: name.to_owned(),
        capture_date: String::new(),
        modification_date: String::new(),
        keywords: String::new(),
    }
}

/// File attributes reported by `getattr`, shaped after a POSIX `stat`.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub is_dir: bool,
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

/// Aggregate free/total space across every storage, reported in
/// 1024-byte blocks for a `statfs`-shaped response.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

/// Translates POSIX-style filesystem operations into MTP transactions
/// against a `Device`, maintaining a lazily-populated node cache rooted at
/// a synthetic root whose children are one synthetic node per storage.
pub struct FsView<T: UsbTransport> {
    device: Device<T>,
    nodes: HashMap<ObjectHandle, Node>,
    lookup: HashMap<ObjectHandle, NodeLookup>,
    modified: Vec<ObjectHandle>,
    supports_partial_object_64: bool,
}

impl<T: UsbTransport> FsView<T> {
    /// Mounts the filesystem: opens a session, fetches `DeviceInfo` once to
    /// cache which optional operations the device supports, and lists
    /// storages to populate the root's children. The root itself is never
    /// refetched.
    pub fn mount(device: Device<T>, timeout: Option<Duration>) -> Result<FsView<T>, Error> {
        device.open_session(timeout)?;
        let supports_partial_object_64 = device.get_device_info(timeout)?.supports_partial_object_64();
        let storage_ids = device.get_storage_ids(timeout)?;

        let mut nodes = HashMap::new();
        let mut lookup = HashMap::new();

        let mut root = Node {
            handle: ROOT_FILE_HANDLE,
            storage_id: ROOT_STORAGE_ID,
            info: synthetic_object_info("", INVALID_FILE_HANDLE, ROOT_STORAGE_ID, true),
            children: vec![],
            fetched: true,
            modified: false,
            accessed: SystemTime::now(),
            mtime: None,
        };
        lookup.insert(
            ROOT_FILE_HANDLE,
            NodeLookup {
                storage_id: ROOT_STORAGE_ID,
                parent: INVALID_FILE_HANDLE,
            },
        );

        for storage_id in storage_ids {
            let storage_info = device.get_storage_info(storage_id, timeout)?;
            let storage_handle = storage_root_handle(storage_id);

            let node = Node {
                handle: storage_handle,
                storage_id,
                info: synthetic_object_info(
                    &storage_info.storage_description,
                    ROOT_FILE_HANDLE,
                    storage_id,
                    true,
                ),
                children: vec![],
                fetched: false,
                modified: false,
                accessed: SystemTime::now(),
                mtime: None,
            };

            root.children.push(storage_handle);
            lookup.insert(
                storage_handle,
                NodeLookup {
                    storage_id,
                    parent: ROOT_FILE_HANDLE,
                },
            );
            nodes.insert(storage_handle, node);
        }

        nodes.insert(ROOT_FILE_HANDLE, root);

        debug!("mounted with {} storages", nodes.len().saturating_sub(1));

        Ok(FsView {
            device,
            nodes,
            lookup,
            modified: vec![],
            supports_partial_object_64,
        })
    }

    fn node(&self, handle: ObjectHandle) -> Result<&Node, Error> {
        self.nodes
            .get(&handle)
            .ok_or(Error::Fs(FsError::NoEntry))
    }

    fn node_mut(&mut self, handle: ObjectHandle) -> Result<&mut Node, Error> {
        self.nodes
            .get_mut(&handle)
            .ok_or(Error::Fs(FsError::NoEntry))
    }

    /// Ensures `handle`'s children are fully enumerated, fetching them
    /// from the device if `fetched` is not already set. Mirrors
    /// `androidfs::lookup`/`readdir`, but (deliberately unlike the
    /// original) looks up each child's info by its actual handle rather
    /// than by loop index.
    fn ensure_fetched(&mut self, handle: ObjectHandle, timeout: Option<Duration>) -> Result<(), Error> {
        if self.node(handle)?.fetched {
            return Ok(());
        }

        if handle == ROOT_FILE_HANDLE {
            return Ok(());
        }

        let storage_id = self.node(handle)?.storage_id;
        let device_parent = self.to_device_handle(handle);

        let handles = self
            .device
            .get_object_handles(storage_id, None, Some(device_parent), timeout)
            .map_err(map_engine_error)?;

        let mut children = Vec::with_capacity(handles.len());
        for h in handles {
            let info = self
                .device
                .get_object_info(h, timeout)
                .map_err(map_engine_error)?;
            self.lookup.insert(
                h,
                NodeLookup {
                    storage_id,
                    parent: handle,
                },
            );
            self.nodes.insert(
                h,
                Node {
                    handle: h,
                    storage_id,
                    info,
                    children: vec![],
                    fetched: false,
                    modified: false,
                    accessed: SystemTime::now(),
                    mtime: None,
                },
            );
            children.push(h);
        }

        let node = self.node_mut(handle)?;
        node.children = children;
        node.fetched = true;

        Ok(())
    }

    fn find_child_by_name(&self, parent: ObjectHandle, name: &str) -> Option<ObjectHandle> {
        self.node(parent)
            .ok()?
            .children
            .iter()
            .copied()
            .find(|h| self.nodes.get(h).map_or(false, |n| n.info.filename == name))
    }

    /// Resolves a `/`-separated absolute path to a node handle, fetching
    /// children lazily along the way.
    pub fn resolve(&mut self, path: &str, timeout: Option<Duration>) -> Result<ObjectHandle, Error> {
        let mut current = ROOT_FILE_HANDLE;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !self.node(current)?.is_dir() && current != ROOT_FILE_HANDLE {
                return Err(Error::Fs(FsError::NotDir));
            }

            if let Some(child) = self.find_child_by_name(current, component) {
                current = child;
                continue;
            }

            self.ensure_fetched(current, timeout)?;

            match self.find_child_by_name(current, component) {
                Some(child) => current = child,
                None => return Err(Error::Fs(FsError::NoEntry)),
            }
        }

        Ok(current)
    }

    fn parent_of(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        self.lookup.get(&handle).map(|l| l.parent)
    }

    /// Translates a node's own handle to the value the device expects as an
    /// MTP parent/location. A storage-root node is keyed by a synthetic
    /// handle in this crate's own tree, but on the wire "top of storage" is
    /// always `MTP_PARENT_ROOT`; every other handle is already the real one.
    fn to_device_handle(&self, handle: ObjectHandle) -> ObjectHandle {
        if self.parent_of(handle) == Some(ROOT_FILE_HANDLE) {
            ObjectHandle::root()
        } else {
            handle
        }
    }

    fn reject_if_root_or_storage_root(&self, handle: ObjectHandle) -> Result<(), Error> {
        if handle == ROOT_FILE_HANDLE || self.parent_of(handle) == Some(ROOT_FILE_HANDLE) {
            return Err(Error::Fs(FsError::Invalid));
        }
        Ok(())
    }

    // --- operation handlers ------------------------------------------------

    pub fn getattr(&mut self, path: &str, timeout: Option<Duration>) -> Result<Attr, Error> {
        let handle = self.resolve(path, timeout)?;
        let node = self.node(handle)?;
        let size = node.info.object_compressed_size as u64;
        Ok(Attr {
            is_dir: node.is_dir(),
            size,
            blocks: (size + 511) / 512,
            mode: if node.is_dir() { 0o775 } else { 0o644 },
            mtime: node
                .mtime
                .or_else(|| node.info.modification_timestamp())
                .unwrap_or(node.accessed),
            atime: node.accessed,
        })
    }

    pub fn readdir(&mut self, path: &str, timeout: Option<Duration>) -> Result<Vec<String>, Error> {
        let handle = self.resolve(path, timeout)?;
        if !self.node(handle)?.is_dir() && handle != ROOT_FILE_HANDLE {
            return Err(Error::Fs(FsError::NotDir));
        }
        self.ensure_fetched(handle, timeout)?;

        let mut names = vec![".".to_owned(), "..".to_owned()];
        for child in &self.node(handle)?.children {
            if let Some(n) = self.nodes.get(child) {
                names.push(n.info.filename.clone());
            }
        }
        Ok(names)
    }

    pub fn read(
        &mut self,
        path: &str,
        offset: u64,
        len: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let handle = self.resolve(path, timeout)?;
        let node = self.node(handle)?;
        if node.is_dir() {
            return Err(Error::Fs(FsError::Invalid));
        }

        if self.supports_partial_object_64 {
            self.device
                .get_partial_object_64(handle, offset, len, timeout)
                .map_err(map_engine_error)
        } else {
            self.device
                .get_partial_object(handle, offset as u32, len, timeout)
                .map_err(map_engine_error)
        }
    }

    pub fn statfs(&mut self, timeout: Option<Duration>) -> Result<StatFs, Error> {
        let storages: Vec<StorageId> = self
            .lookup
            .iter()
            .filter(|(h, l)| **h != ROOT_FILE_HANDLE && l.parent == ROOT_FILE_HANDLE)
            .map(|(h, _)| self.node(*h).map(|n| n.storage_id))
            .collect::<Result<_, _>>()?;

        let mut total = 0u64;
        let mut free = 0u64;
        for storage in storages {
            let info = self
                .device
                .get_storage_info(storage, timeout)
                .map_err(map_engine_error)?;
            total += info.max_capacity;
            free += info.free_space_in_bytes;
        }

        Ok(StatFs {
            block_size: 1024,
            total_blocks: total / 1024,
            free_blocks: free / 1024,
        })
    }

    pub fn utimes(
        &mut self,
        path: &str,
        atime: SystemTime,
        mtime: SystemTime,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let handle = self.resolve(path, timeout)?;
        let node = self.node_mut(handle)?;
        node.accessed = atime;
        node.mtime = Some(mtime);
        node.modified = true;
        if !self.modified.contains(&handle) {
            self.modified.push(handle);
        }
        Ok(())
    }

    fn create_object(
        &mut self,
        parent_path: &str,
        name: &str,
        is_dir: bool,
        timeout: Option<Duration>,
    ) -> Result<ObjectHandle, Error> {
        let parent = self.resolve(parent_path, timeout)?;
        if is_dir && parent == ROOT_FILE_HANDLE {
            return Err(Error::Fs(FsError::Invalid));
        }

        let storage_id = self.node(parent)?.storage_id;
        let device_parent = self.to_device_handle(parent);
        let info = synthetic_object_info(name, device_parent, storage_id, is_dir);

        let new_handle = self
            .device
            .send_object_info(storage_id, device_parent, &info, timeout)
            .map_err(map_engine_error)?;

        self.lookup.insert(
            new_handle,
            NodeLookup {
                storage_id,
                parent,
            },
        );
        self.nodes.insert(
            new_handle,
            Node {
                handle: new_handle,
                storage_id,
                info,
                children: vec![],
                fetched: true,
                modified: false,
                accessed: SystemTime::now(),
                mtime: None,
            },
        );
        self.node_mut(parent)?.children.push(new_handle);

        Ok(new_handle)
    }

    pub fn create(
        &mut self,
        parent_path: &str,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<ObjectHandle, Error> {
        self.create_object(parent_path, name, false, timeout)
    }

    pub fn mkdir(
        &mut self,
        parent_path: &str,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<ObjectHandle, Error> {
        self.create_object(parent_path, name, true, timeout)
    }

    pub fn unlink(&mut self, path: &str, timeout: Option<Duration>) -> Result<(), Error> {
        let handle = self.resolve(path, timeout)?;
        self.reject_if_root_or_storage_root(handle)?;

        let node = self.node(handle)?;
        if node.is_dir() {
            self.ensure_fetched(handle, timeout)?;
            if !self.node(handle)?.children.is_empty() {
                return Err(Error::Fs(FsError::NotEmpty));
            }
        }

        self.device
            .delete_object(handle, timeout)
            .map_err(map_engine_error)?;

        if let Some(parent) = self.parent_of(handle) {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|h| *h != handle);
            }
        }
        self.nodes.remove(&handle);
        self.lookup.remove(&handle);
        self.modified.retain(|h| *h != handle);

        Ok(())
    }

    /// Renames an object in place by setting its `Name` property.
    /// Cross-directory moves are not attempted — MTP's `MoveObject` is an
    /// optional operation this crate does not assume is supported.
    pub fn rename(
        &mut self,
        old_path: &str,
        new_name: &str,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let handle = self.resolve(old_path, timeout)?;
        self.reject_if_root_or_storage_root(handle)?;

        self.device
            .set_object_prop_value(
                handle,
                OBJECT_PROP_NAME,
                &PtpData::STR(new_name.to_owned()),
                timeout,
            )
            .map_err(map_engine_error)?;

        self.node_mut(handle)?.info.filename = new_name.to_owned();
        Ok(())
    }

    pub fn write(&mut self, _path: &str, _data: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        warn!("write() is not supported: MTP has no partial/append write");
        Err(Error::Fs(FsError::NotSupported))
    }

    pub fn symlink(&mut self, _path: &str, _target: &str) -> Result<(), Error> {
        Err(Error::Fs(FsError::NotSupported))
    }

    pub fn readlink(&mut self, _path: &str) -> Result<String, Error> {
        Err(Error::Fs(FsError::NotSupported))
    }

    pub fn chmod(&mut self, _path: &str, _mode: u32) -> Result<(), Error> {
        Err(Error::Fs(FsError::NotSupported))
    }

    /// Re-pushes `ObjectInfo` for every handle with pending edits via
    /// `SendObjectInfo`, then clears the modified set. Handles, not raw
    /// node pointers, are what the set stores, so a lookup miss here
    /// (node removed since) is simply skipped rather than dereferenced.
    pub fn fsync(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let handles = std::mem::take(&mut self.modified);
        for handle in handles {
            let (storage_id, parent, info) = {
                let node = match self.nodes.get(&handle) {
                    Some(n) => n,
                    None => continue,
                };
                let parent = self.parent_of(handle).unwrap_or(ROOT_FILE_HANDLE);
                (node.storage_id, self.to_device_handle(parent), node.info.clone())
            };

            self.device
                .send_object_info(storage_id, parent, &info, timeout)
                .map_err(map_engine_error)?;

            if let Some(node) = self.nodes.get_mut(&handle) {
                node.modified = false;
            }
        }
        Ok(())
    }

    /// Drops a node's `fetched` flag (and its cached children) so the next
    /// access re-fetches from the device. Nothing calls this
    /// automatically; a caller wiring up device events may invoke it in
    /// response to `ObjectAdded`/`ObjectRemoved`/`ObjectInfoChanged`.
    pub fn invalidate(&mut self, handle: ObjectHandle) {
        if let Some(node) = self.nodes.get_mut(&handle) {
            let stale_children = std::mem::take(&mut node.children);
            node.fetched = false;
            for child in stale_children {
                self.nodes.remove(&child);
                self.lookup.remove(&child);
            }
        }
    }
}

/// A handle for a storage-root node, unique per storage within this
/// crate's own tree. Each storage's "top" is the same `MTP_PARENT_ROOT`
/// wire sentinel, so it can't double as a cache key once there is more
/// than one storage; callers translate back to the wire sentinel with
/// `ObjectHandle::root()` before issuing device commands.
fn storage_root_handle(storage_id: StorageId) -> ObjectHandle {
    ObjectHandle::from_raw(0x8000_0000 | (storage_id.raw() & 0x7FFF_FFFF))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PtpWrite;
    use crate::storage::{AccessType, FilesystemType, StorageType};
    use crate::transport::mock::{self, MockResponse, MockTransport};
    use std::sync::Arc;

    const OK: u16 = 0x2001;

    fn u32_vec_payload(vals: &[u32]) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_ptp_u32_vec(vals).unwrap();
        buf
    }

    fn storage_info_payload(description: &str) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_ptp_u16(StorageType::FixedRom as u16).unwrap();
        buf.write_ptp_u16(FilesystemType::GenericHierarchical as u16)
            .unwrap();
        buf.write_ptp_u16(AccessType::ReadWrite as u16).unwrap();
        buf.write_ptp_u64(1_000_000).unwrap();
        buf.write_ptp_u64(500_000).unwrap();
        buf.write_ptp_u32(0xFFFFFFFF).unwrap();
        buf.write_ptp_str(description).unwrap();
        buf.write_ptp_str("").unwrap();
        buf
    }

    fn device_info_payload(extra_ops: &[u16]) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_ptp_u16(100).unwrap();
        buf.write_ptp_u32(0).unwrap();
        buf.write_ptp_u16(0).unwrap();
        buf.write_ptp_str("").unwrap();
        buf.write_ptp_u16(0).unwrap();
        let mut ops = vec![0x1001u16, 0x1008, 0x101B];
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

    fn send_object_info_response_payload(storage_id: u32, parent_handle: u32, new_handle: u32) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_ptp_u32(storage_id).unwrap();
        buf.write_ptp_u32(parent_handle).unwrap();
        buf.write_ptp_u32(new_handle).unwrap();
        buf
    }

    fn encoded_photo() -> Vec<u8> {
        let info = synthetic_object_info(
            "photo.jpg",
            storage_root_handle(StorageId::from_raw(1)),
            StorageId::from_raw(1),
            false,
        );
        let mut buf = vec![];
        info.encode(&mut buf).unwrap();
        buf
    }

    /// Mounts a single-storage device: session open (tid 0), `GetDeviceInfo`
    /// (tid 1, advertising `extra_ops` in addition to the baseline set),
    /// `GetStorageIDs` (tid 2), `GetStorageInfo` (tid 3), then whatever
    /// `extra` scripts for transactions after mount.
    fn mount_one_storage_with_caps(extra_ops: &[u16], mut extra: Vec<MockResponse>) -> FsView<MockTransport> {
        let mut responses = vec![
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
            MockResponse::Bulk(mock::container(2, 0x1001, 1, &device_info_payload(extra_ops))),
            MockResponse::Bulk(mock::container(3, OK, 1, &[])),
            MockResponse::Bulk(mock::container(2, 0x1004, 2, &u32_vec_payload(&[1]))),
            MockResponse::Bulk(mock::container(3, OK, 2, &[])),
            MockResponse::Bulk(mock::container(
                2,
                0x1005,
                3,
                &storage_info_payload("Internal Storage"),
            )),
            MockResponse::Bulk(mock::container(3, OK, 3, &[])),
        ];
        responses.append(&mut extra);
        let transport = MockTransport::scripted(responses);
        let device = Device::new(transport);
        FsView::mount(device, None).unwrap()
    }

    fn mount_one_storage(extra: Vec<MockResponse>) -> FsView<MockTransport> {
        mount_one_storage_with_caps(&[], extra)
    }

    /// The `GetObjectHandles`/`GetObjectInfo` pair `ensure_fetched` issues
    /// the first time a storage root's children are listed, tids 4 and 5.
    fn fetch_one_photo_responses() -> Vec<MockResponse> {
        vec![
            MockResponse::Bulk(mock::container(2, 0x1007, 4, &u32_vec_payload(&[100]))),
            MockResponse::Bulk(mock::container(3, OK, 4, &[])),
            MockResponse::Bulk(mock::container(2, 0x1008, 5, &encoded_photo())),
            MockResponse::Bulk(mock::container(3, OK, 5, &[])),
        ]
    }

    #[test]
    fn mount_lists_storages_as_root_children() {
        let mut fsview = mount_one_storage(vec![]);
        let names = fsview.readdir("/", None).unwrap();
        assert!(names.contains(&"Internal Storage".to_owned()));
        assert!(names.contains(&".".to_owned()));
        assert!(names.contains(&"..".to_owned()));
    }

    #[test]
    fn lazy_descent_fetches_children_on_first_access() {
        let mut fsview = mount_one_storage(fetch_one_photo_responses());
        let names = fsview.readdir("/Internal Storage", None).unwrap();
        assert!(names.contains(&"photo.jpg".to_owned()));
    }

    #[test]
    fn fetched_flag_prevents_refetching_on_subsequent_access() {
        let mut fsview = mount_one_storage(fetch_one_photo_responses());
        let first = fsview.readdir("/Internal Storage", None).unwrap();
        // If ensure_fetched re-fetched here it would drain the exhausted
        // queue and fail with rusb::Error::NoDevice.
        let second = fsview.readdir("/Internal Storage", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalidate_forces_a_refetch_on_next_access() {
        let mut extra = fetch_one_photo_responses();
        extra.extend(vec![
            MockResponse::Bulk(mock::container(2, 0x1007, 6, &u32_vec_payload(&[100]))),
            MockResponse::Bulk(mock::container(3, OK, 6, &[])),
            MockResponse::Bulk(mock::container(2, 0x1008, 7, &encoded_photo())),
            MockResponse::Bulk(mock::container(3, OK, 7, &[])),
        ]);
        let mut fsview = mount_one_storage(extra);

        fsview.readdir("/Internal Storage", None).unwrap();
        fsview.invalidate(storage_root_handle(StorageId::from_raw(1)));
        let names = fsview.readdir("/Internal Storage", None).unwrap();
        assert!(names.contains(&"photo.jpg".to_owned()));
    }

    #[test]
    fn read_prefers_64_bit_partial_object_when_the_device_supports_it() {
        let mut extra = fetch_one_photo_responses();
        extra.extend(vec![
            MockResponse::Bulk(mock::container(2, 0x95C1, 6, b"hello")),
            MockResponse::Bulk(mock::container(3, OK, 6, &[])),
        ]);
        // capability comes from the cached `DeviceInfo` fetched at mount,
        // not a fresh query on every read.
        let mut fsview = mount_one_storage_with_caps(&[0x95C1], extra);

        let data = fsview
            .read("/Internal Storage/photo.jpg", 0, 5, None)
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn read_falls_back_to_32_bit_partial_object_without_support() {
        let mut extra = fetch_one_photo_responses();
        extra.extend(vec![
            MockResponse::Bulk(mock::container(2, 0x101B, 6, b"hello")),
            MockResponse::Bulk(mock::container(3, OK, 6, &[])),
        ]);
        let mut fsview = mount_one_storage_with_caps(&[], extra);

        let data = fsview
            .read("/Internal Storage/photo.jpg", 0, 5, None)
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn statfs_aggregates_free_and_total_space_across_storages() {
        let extra = vec![
            MockResponse::Bulk(mock::container(
                2,
                0x1005,
                4,
                &storage_info_payload("Internal Storage"),
            )),
            MockResponse::Bulk(mock::container(3, OK, 4, &[])),
        ];
        let mut fsview = mount_one_storage(extra);
        let stat = fsview.statfs(None).unwrap();
        assert_eq!(stat.block_size, 1024);
        assert_eq!(stat.total_blocks, 1_000_000 / 1024);
        assert_eq!(stat.free_blocks, 500_000 / 1024);
    }

    #[test]
    fn root_and_storage_root_are_immutable() {
        let mut fsview = mount_one_storage(vec![]);

        let err = fsview.unlink("/", None).unwrap_err();
        assert!(matches!(err, Error::Fs(FsError::Invalid)));

        let err = fsview.rename("/Internal Storage", "x", None).unwrap_err();
        assert!(matches!(err, Error::Fs(FsError::Invalid)));
    }

    #[test]
    fn resolving_a_missing_path_is_no_entry() {
        let mut fsview = mount_one_storage(fetch_one_photo_responses());
        let err = fsview.getattr("/Internal Storage/nope.jpg", None).unwrap_err();
        assert!(matches!(err, Error::Fs(FsError::NoEntry)));
    }

    /// A storage root is keyed by a synthetic handle in this crate's own
    /// node cache, but `SendObjectInfo` must still see the real
    /// `MTP_PARENT_ROOT` sentinel as the parent, not that synthetic value.
    #[test]
    fn create_in_a_storage_root_sends_the_wire_root_sentinel_as_parent() {
        let responses = vec![
            MockResponse::Bulk(mock::container(3, OK, 0, &[])),
            MockResponse::Bulk(mock::container(2, 0x1001, 1, &device_info_payload(&[]))),
            MockResponse::Bulk(mock::container(3, OK, 1, &[])),
            MockResponse::Bulk(mock::container(2, 0x1004, 2, &u32_vec_payload(&[1]))),
            MockResponse::Bulk(mock::container(3, OK, 2, &[])),
            MockResponse::Bulk(mock::container(
                2,
                0x1005,
                3,
                &storage_info_payload("Internal Storage"),
            )),
            MockResponse::Bulk(mock::container(3, OK, 3, &[])),
            MockResponse::Bulk(mock::container(
                2,
                0x100C,
                4,
                &send_object_info_response_payload(1, 0xFFFFFFFF, 200),
            )),
            MockResponse::Bulk(mock::container(3, OK, 4, &[])),
        ];
        let transport = Arc::new(MockTransport::scripted(responses));
        let device = Device::new(transport.clone());
        let mut fsview = FsView::mount(device, None).unwrap();

        fsview.create("/Internal Storage", "new.txt", None).unwrap();

        let sent = transport.sent();
        // mount issues one command-only bulk_write per call (tids 0-3);
        // send_object_info adds a command phase then a data phase (tid 4).
        let command_phase = &sent[4];
        let parent_param = u32::from_le_bytes(command_phase[16..20].try_into().unwrap());
        assert_eq!(parent_param, 0xFFFFFFFF);
    }
}
