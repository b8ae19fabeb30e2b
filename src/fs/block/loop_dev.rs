//! Binding a byte range of a device to one of the first loop devices.

use std::{
    fs::OpenOptions,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use loopdev::LoopDevice;

use crate::fs::sysfs::parse_c_integer;

/// Number of `/dev/loopN` nodes probed before giving up.
pub const LOOP_SLOT_COUNT: u32 = 8;

/// A byte range of `backing` to expose as a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRequest {
    pub backing: PathBuf,
    pub offset: u64,
    /// Length of the range, `None` for "up to the end of `backing`".
    pub size_limit: Option<u64>,
}

impl LoopRequest {
    fn is_bound_as(&self, status: &LoopStatus) -> bool {
        status.offset == self.offset && status.backing == self.backing
    }
}

/// What a bound loop device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub backing: PathBuf,
    pub offset: u64,
}

/// The loop device nodes a binder may use.
pub trait LoopSlots {
    type Slot: LoopSlot;

    fn open(&self, index: u32) -> std::io::Result<Self::Slot>;
}

/// An open loop device node.
pub trait LoopSlot {
    fn path(&self) -> &Path;

    /// Current binding, `None` when the device is free.
    fn status(&self) -> Result<Option<LoopStatus>>;

    /// Bind the requested range with the auto-clear flag. On failure the
    /// device is left unbound.
    fn attach(&self, request: &LoopRequest) -> Result<()>;

    /// Keep the open handle until the process exits. Auto-clear only
    /// releases the binding once the last handle is closed.
    fn persist_until_exit(self);
}

/// The `/dev/loopN` nodes of the running kernel.
pub struct KernelLoopSlots {
    prefix: PathBuf,
    sys_class_block: PathBuf,
}

impl KernelLoopSlots {
    pub fn new(prefix: impl Into<PathBuf>, sys_class_block: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            sys_class_block: sys_class_block.into(),
        }
    }
}

impl Default for KernelLoopSlots {
    fn default() -> Self {
        Self::new("/dev/loop", "/sys/class/block")
    }
}

impl LoopSlots for KernelLoopSlots {
    type Slot = KernelLoopDevice;

    fn open(&self, index: u32) -> std::io::Result<Self::Slot> {
        let mut path = self.prefix.clone().into_os_string();
        path.push(index.to_string());
        let path = PathBuf::from(path);

        let device = LoopDevice::open(&path)?;
        let status_dir = self
            .sys_class_block
            .join(format!("loop{index}"))
            .join("loop");
        Ok(KernelLoopDevice {
            path,
            status_dir,
            device,
        })
    }
}

pub struct KernelLoopDevice {
    path: PathBuf,
    /// `/sys/class/block/loopN/loop`, only present while the device is bound.
    status_dir: PathBuf,
    device: LoopDevice,
}

/// Read the binding of a loop device from its sysfs `loop` directory.
/// A missing directory means the device is free.
fn read_loop_status(status_dir: &Path) -> Result<Option<LoopStatus>> {
    let backing_file = status_dir.join("backing_file");
    let backing = match std::fs::read_to_string(&backing_file) {
        Ok(backing) => backing,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("Failed to read {backing_file:?}"))
        }
    };

    let offset_file = status_dir.join("offset");
    let offset = std::fs::read_to_string(&offset_file)
        .with_context(|| format!("Failed to read {offset_file:?}"))?;
    let offset = parse_c_integer(&offset)
        .with_context(|| format!("{offset_file:?} is not a number: {:?}", offset.trim_end()))?;

    Ok(Some(LoopStatus {
        backing: PathBuf::from(backing.trim_end_matches('\n')),
        offset,
    }))
}

impl LoopSlot for KernelLoopDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> Result<Option<LoopStatus>> {
        read_loop_status(&self.status_dir)
    }

    fn attach(&self, request: &LoopRequest) -> Result<()> {
        let mut options = self.device.with().offset(request.offset).autoclear(true);
        if let Some(size_limit) = request.size_limit {
            options = options.size_limit(size_limit);
        }
        options
            .attach(&request.backing)
            .with_context(|| format!("Failed to attach {:?} to {:?}", request.backing, self.path))
    }

    fn persist_until_exit(self) {
        std::mem::forget(self.device);
    }
}

/// Expose `request` through one of the first [`LOOP_SLOT_COUNT`] loop
/// devices and return its path. A device already bound to exactly the same
/// backing path and offset is reused as is.
pub fn bind<S: LoopSlots>(slots: &S, request: &LoopRequest) -> Result<PathBuf> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&request.backing)
        .with_context(|| format!("Failed to open backing device {:?}", request.backing))?;

    for index in 0..LOOP_SLOT_COUNT {
        let slot = match slots.open(index) {
            Ok(slot) => slot,
            Err(error) => {
                tracing::trace!(index, ?error, "Cannot open loop device");
                continue;
            }
        };

        match slot.status() {
            Ok(Some(status)) => {
                if request.is_bound_as(&status) {
                    tracing::debug!(
                        loop_device = ?slot.path(),
                        backing = ?request.backing,
                        offset = request.offset,
                        "Reusing loop device bound by an earlier run"
                    );
                    return Ok(slot.path().to_owned());
                }
                continue;
            }
            Ok(None) => {}
            Err(error) => {
                tracing::trace!(loop_device = ?slot.path(), ?error, "Cannot query loop device");
                continue;
            }
        }

        if let Err(error) = slot.attach(request) {
            tracing::debug!(loop_device = ?slot.path(), ?error, "Failed to bind loop device");
            continue;
        }

        let path = slot.path().to_owned();
        tracing::debug!(
            loop_device = ?path,
            backing = ?request.backing,
            offset = request.offset,
            size_limit = ?request.size_limit,
            "Bound loop device"
        );
        slot.persist_until_exit();
        return Ok(path);
    }

    bail!(
        "No usable loop device among the first {LOOP_SLOT_COUNT} for {:?} at offset {}",
        request.backing,
        request.offset
    )
}

#[cfg(test)]
pub mod tests {

    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    #[derive(Debug, Clone)]
    enum FakeState {
        Missing,
        Broken,
        Free,
        RejectAttach,
        Bound(LoopStatus),
    }

    /// In-memory loop devices. Shared state lets the test look at the
    /// result after slots were consumed.
    #[derive(Clone)]
    struct FakeSlots {
        states: Rc<RefCell<HashMap<u32, FakeState>>>,
        attached: Rc<RefCell<Vec<(u32, LoopRequest)>>>,
        persisted: Rc<RefCell<Vec<u32>>>,
    }

    impl FakeSlots {
        fn new(states: impl IntoIterator<Item = (u32, FakeState)>) -> Self {
            Self {
                states: Rc::new(RefCell::new(states.into_iter().collect())),
                attached: Default::default(),
                persisted: Default::default(),
            }
        }
    }

    struct FakeSlot {
        index: u32,
        path: PathBuf,
        slots: FakeSlots,
    }

    impl LoopSlots for FakeSlots {
        type Slot = FakeSlot;

        fn open(&self, index: u32) -> std::io::Result<Self::Slot> {
            match self.states.borrow().get(&index) {
                None | Some(FakeState::Missing) => {
                    Err(std::io::Error::from(std::io::ErrorKind::NotFound))
                }
                Some(_) => Ok(FakeSlot {
                    index,
                    path: PathBuf::from(format!("/dev/loop{index}")),
                    slots: self.clone(),
                }),
            }
        }
    }

    impl LoopSlot for FakeSlot {
        fn path(&self) -> &Path {
            &self.path
        }

        fn status(&self) -> Result<Option<LoopStatus>> {
            match self.slots.states.borrow().get(&self.index) {
                Some(FakeState::Bound(status)) => Ok(Some(status.clone())),
                Some(FakeState::Broken) => bail!("Input/output error"),
                _ => Ok(None),
            }
        }

        fn attach(&self, request: &LoopRequest) -> Result<()> {
            let mut states = self.slots.states.borrow_mut();
            if let Some(FakeState::RejectAttach) = states.get(&self.index) {
                bail!("device busy")
            }
            states.insert(
                self.index,
                FakeState::Bound(LoopStatus {
                    backing: request.backing.clone(),
                    offset: request.offset,
                }),
            );
            self.slots
                .attached
                .borrow_mut()
                .push((self.index, request.clone()));
            Ok(())
        }

        fn persist_until_exit(self) {
            self.slots.persisted.borrow_mut().push(self.index);
        }
    }

    fn request(backing: &NamedTempFile, offset: u64) -> LoopRequest {
        LoopRequest {
            backing: backing.path().to_owned(),
            offset,
            size_limit: None,
        }
    }

    #[test]
    fn test_bind_first_free_slot() -> Result<()> {
        let backing = NamedTempFile::new()?;
        let slots = FakeSlots::new([
            (
                0,
                FakeState::Bound(LoopStatus {
                    backing: "/dev/other".into(),
                    offset: 0,
                }),
            ),
            (1, FakeState::Missing),
            (2, FakeState::Broken),
            (3, FakeState::RejectAttach),
            (4, FakeState::Free),
            (5, FakeState::Free),
        ]);

        let path = bind(&slots, &request(&backing, 0x10000))?;

        assert_eq!(path, PathBuf::from("/dev/loop4"));
        assert_eq!(slots.attached.borrow().len(), 1);
        assert_eq!(*slots.persisted.borrow(), vec![4]);
        Ok(())
    }

    #[test]
    fn test_bind_twice_reuses_binding() -> Result<()> {
        let backing = NamedTempFile::new()?;
        let slots = FakeSlots::new((0..LOOP_SLOT_COUNT).map(|i| (i, FakeState::Free)));

        let first = bind(&slots, &request(&backing, 0xa0_0000))?;
        let second = bind(&slots, &request(&backing, 0xa0_0000))?;

        assert_eq!(first, second);
        assert_eq!(slots.attached.borrow().len(), 1);
        assert_eq!(slots.persisted.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn test_bind_other_offset_takes_new_slot() -> Result<()> {
        let backing = NamedTempFile::new()?;
        let slots = FakeSlots::new((0..LOOP_SLOT_COUNT).map(|i| (i, FakeState::Free)));

        let first = bind(&slots, &request(&backing, 0))?;
        let second = bind(&slots, &request(&backing, 0x10000))?;

        assert_ne!(first, second);
        assert_eq!(slots.attached.borrow().len(), 2);
        Ok(())
    }

    #[test]
    fn test_bind_exhausted() -> Result<()> {
        let backing = NamedTempFile::new()?;
        let slots = FakeSlots::new((0..LOOP_SLOT_COUNT).map(|i| {
            (
                i,
                FakeState::Bound(LoopStatus {
                    backing: format!("/dev/sd{i}").into(),
                    offset: 0,
                }),
            )
        }));
        // Slots past the probed range are never looked at.
        slots
            .states
            .borrow_mut()
            .insert(LOOP_SLOT_COUNT, FakeState::Free);

        assert!(bind(&slots, &request(&backing, 0)).is_err());
        assert!(slots.attached.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_bind_missing_backing() {
        let slots = FakeSlots::new([(0, FakeState::Free)]);
        let request = LoopRequest {
            backing: "/nonexistent/rootdisk-backing".into(),
            offset: 0,
            size_limit: None,
        };

        assert!(bind(&slots, &request).is_err());
        assert!(slots.attached.borrow().is_empty());
    }

    #[test]
    fn test_read_loop_status_from_sysfs() -> Result<()> {
        let dir = TempDir::new()?;
        let status_dir = dir.path().join("loop0/loop");

        assert_eq!(read_loop_status(&status_dir)?, None);

        std::fs::create_dir_all(&status_dir)?;
        std::fs::write(status_dir.join("backing_file"), "/dev/mmcblk0\n")?;
        std::fs::write(status_dir.join("offset"), "18874368\n")?;
        let status = read_loop_status(&status_dir)?;

        assert_eq!(
            status,
            Some(LoopStatus {
                backing: "/dev/mmcblk0".into(),
                offset: 0x0120_0000,
            })
        );
        let request = LoopRequest {
            backing: "/dev/mmcblk0".into(),
            offset: 0x0120_0000,
            size_limit: Some(0x0100_0000),
        };
        assert!(status.is_some_and(|status| request.is_bound_as(&status)));
        Ok(())
    }

    #[test]
    fn test_read_loop_status_bad_offset() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("backing_file"), "/dev/vda\n")?;
        std::fs::write(dir.path().join("offset"), "garbage\n")?;

        assert!(read_loop_status(dir.path()).is_err());
        Ok(())
    }
}
