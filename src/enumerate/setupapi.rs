//! SetupAPI / CfgMgr32 device tree backend.
//!
//! Every call opens a fresh device information set over all present devices
//! of every class and destroys it on the way out, including early returns.

use windows::Win32::Devices::DeviceAndDriverInstallation::{
    CM_DEVNODE_STATUS_FLAGS, CM_Get_DevNode_Status, CM_PROB, CR_SUCCESS, DIGCF_ALLCLASSES,
    DIGCF_PRESENT, DN_STARTED, HDEVINFO, SETUP_DI_REGISTRY_PROPERTY, SP_DEVINFO_DATA,
    SPDRP_DEVICEDESC, SPDRP_FRIENDLYNAME, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInfo,
    SetupDiGetClassDevsW, SetupDiGetDeviceInstanceIdW, SetupDiGetDeviceRegistryPropertyW,
};
use windows::core::PCWSTR;

use super::{DeviceStatus, DeviceTree, EnumerationError, IdMatch, PresentDevice};

/// Instance ids are capped at `MAX_DEVICE_ID_LEN` (200) characters.
const INSTANCE_ID_CAPACITY: usize = 256;
const PROPERTY_CAPACITY: usize = 1024;

/// Native device tree backed by SetupAPI.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetupApiTree;

impl DeviceTree for SetupApiTree {
    fn query(&self, id: &str, id_match: IdMatch) -> Result<DeviceStatus, EnumerationError> {
        let set = DeviceInfoSet::present_devices()?;

        for (data, instance_id) in set.entries() {
            if id_match.matches(id, &instance_id) {
                return Ok(DeviceStatus {
                    present: true,
                    enabled: is_started(&data),
                });
            }
        }

        Ok(DeviceStatus::ABSENT)
    }

    fn display_name(
        &self,
        id: &str,
        id_match: IdMatch,
    ) -> Result<Option<String>, EnumerationError> {
        let set = DeviceInfoSet::present_devices()?;

        for (data, instance_id) in set.entries() {
            if id_match.matches(id, &instance_id) {
                return Ok(set.describe(&data));
            }
        }

        Ok(None)
    }

    fn list_usb(&self) -> Result<Vec<PresentDevice>, EnumerationError> {
        let set = DeviceInfoSet::present_devices()?;

        let mut devices: Vec<_> = set
            .entries()
            .filter(|(_, instance_id)| {
                instance_id
                    .get(..3)
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case("USB"))
            })
            .map(|(data, instance_id)| PresentDevice {
                name: set
                    .describe(&data)
                    .unwrap_or_else(|| super::UNKNOWN_DEVICE_NAME.to_string()),
                enabled: is_started(&data),
                instance_id,
            })
            .collect();

        devices.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(devices)
    }
}

/// Owned `HDEVINFO`, destroyed on drop.
struct DeviceInfoSet(HDEVINFO);

impl DeviceInfoSet {
    fn present_devices() -> Result<Self, EnumerationError> {
        // SAFETY: no class GUID, enumerator or parent window; flags request
        // every present device. The returned handle is owned by `Self`.
        let handle = unsafe {
            SetupDiGetClassDevsW(None, PCWSTR::null(), None, DIGCF_PRESENT | DIGCF_ALLCLASSES)
        }
        .map_err(|e| EnumerationError::Unavailable(e.to_string()))?;

        Ok(Self(handle))
    }

    fn entries(&self) -> Entries<'_> {
        Entries { set: self, index: 0 }
    }

    /// Device description, then friendly name.
    fn describe(&self, data: &SP_DEVINFO_DATA) -> Option<String> {
        self.property_string(data, SPDRP_DEVICEDESC)
            .or_else(|| self.property_string(data, SPDRP_FRIENDLYNAME))
    }

    fn property_string(
        &self,
        data: &SP_DEVINFO_DATA,
        property: SETUP_DI_REGISTRY_PROPERTY,
    ) -> Option<String> {
        let mut buffer = vec![0u8; PROPERTY_CAPACITY];

        // SAFETY: `data` was filled by SetupDiEnumDeviceInfo on this set and
        // the buffer length is passed through the slice.
        unsafe {
            SetupDiGetDeviceRegistryPropertyW(self.0, data, property, None, Some(&mut buffer), None)
        }
        .ok()?;

        let wide: Vec<u16> = buffer
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&c| c != 0)
            .collect();

        let value = String::from_utf16_lossy(&wide);
        (!value.trim().is_empty()).then_some(value)
    }
}

impl Drop for DeviceInfoSet {
    fn drop(&mut self) {
        // SAFETY: the handle came from SetupDiGetClassDevsW and is destroyed once.
        unsafe {
            let _ = SetupDiDestroyDeviceInfoList(self.0);
        }
    }
}

/// Iterator over `(devinfo data, instance id)` pairs of a set.
struct Entries<'a> {
    set: &'a DeviceInfoSet,
    index: u32,
}

impl Iterator for Entries<'_> {
    type Item = (SP_DEVINFO_DATA, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut data = SP_DEVINFO_DATA {
                cbSize: u32::try_from(std::mem::size_of::<SP_DEVINFO_DATA>()).ok()?,
                ..Default::default()
            };

            // SAFETY: `data.cbSize` is initialized; the set outlives the iterator.
            unsafe { SetupDiEnumDeviceInfo(self.set.0, self.index, &mut data) }.ok()?;
            self.index += 1;

            let mut buffer = [0u16; INSTANCE_ID_CAPACITY];
            // SAFETY: buffer length is carried by the slice.
            let found = unsafe {
                SetupDiGetDeviceInstanceIdW(self.set.0, &data, Some(&mut buffer), None)
            };
            if found.is_err() {
                continue;
            }

            let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
            return Some((data, String::from_utf16_lossy(&buffer[..len])));
        }
    }
}

/// `DN_STARTED` set in the node status.
fn is_started(data: &SP_DEVINFO_DATA) -> bool {
    let mut status = CM_DEVNODE_STATUS_FLAGS::default();
    let mut problem = CM_PROB::default();

    // SAFETY: out-pointers reference live locals.
    let result = unsafe { CM_Get_DevNode_Status(&mut status, &mut problem, data.DevInst, 0) };

    result == CR_SUCCESS && (status.0 & DN_STARTED.0) != 0
}
