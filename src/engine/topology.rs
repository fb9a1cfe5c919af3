//! The logical drive table and the topology rescan that keeps it in step
//! with the volumes the firmware exports.

use color_eyre::{
    Result,
    eyre::{OptionExt, WrapErr, ensure},
};
use tracing::{debug, info, warn};

use super::Controller;
use crate::ciss::command_list::LunAddress;
use crate::error::DriveError;
use crate::scsi::command::{
    VPD_DEVICE_ID, VPD_GEOMETRY, inquiry, inquiry_vpd, read_capacity_10, read_capacity_16,
    report_logical_luns,
};
use crate::scsi::response::{
    DEVICE_ID_LEN, Geometry, INQUIRY_LEN, ReadCapacity10, ReadCapacity16, VPD_LEN,
    device_id_response, inquiry_response, report_luns_response,
};

/// Geometry assumed for volumes that cannot report their own.
const DEFAULT_HEADS: u32 = 255;
const DEFAULT_SECTORS: u32 = 32;

/// One entry of the logical drive table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalDrive {
    /// `None` for the controller's own node while no volume occupies slot 0.
    pub lun_id: Option<LunAddress>,
    /// Zero means the entry carries no usable volume.
    pub heads: u32,
    pub sectors: u32,
    pub cylinders: u32,
    pub block_size: u32,
    pub nr_blocks: u64,
    pub raid_level: Option<u8>,
    pub vendor: String,
    pub model: String,
    pub rev: String,
    pub serial: [u8; DEVICE_ID_LEN],
    /// Current openers.
    pub usage_count: u32,
    pub busy_configuring: bool,
}

impl LogicalDrive {
    /// The node left in slot 0 so the configuration utility always has
    /// something to open.
    pub fn controller_node() -> Self {
        Self::default()
    }

    fn apply(&mut self, info: VolumeInfo) {
        self.heads = info.heads;
        self.sectors = info.sectors;
        self.cylinders = info.cylinders;
        self.block_size = info.block_size;
        self.nr_blocks = info.nr_blocks;
        self.raid_level = info.raid_level;
        self.vendor = info.vendor;
        self.model = info.model;
        self.rev = info.rev;
        self.serial = info.serial;
    }

    fn matches(&self, info: &VolumeInfo) -> bool {
        self.heads == info.heads
            && self.sectors == info.sectors
            && self.cylinders == info.cylinders
            && self.block_size == info.block_size
            && self.nr_blocks == info.nr_blocks
            && self.raid_level == info.raid_level
            && self.vendor == info.vendor
            && self.model == info.model
            && self.rev == info.rev
            && self.serial == info.serial
    }
}

/// What probing a volume found out about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub heads: u32,
    pub sectors: u32,
    pub cylinders: u32,
    pub block_size: u32,
    pub nr_blocks: u64,
    pub raid_level: Option<u8>,
    pub vendor: String,
    pub model: String,
    pub rev: String,
    pub serial: [u8; DEVICE_ID_LEN],
}

pub struct DriveTable {
    drives: Vec<Option<LogicalDrive>>,
    highest: Option<usize>,
}

impl DriveTable {
    pub fn new(max_luns: usize) -> Self {
        let mut drives = vec![None; max_luns.max(1)];
        drives[0] = Some(LogicalDrive::controller_node());
        Self {
            drives,
            highest: None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&LogicalDrive> {
        self.drives.get(index)?.as_ref()
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut LogicalDrive> {
        self.drives.get_mut(index)?.as_mut()
    }

    /// Highest index holding a volume with geometry.
    pub fn highest_lun(&self) -> Option<usize> {
        self.highest
    }

    pub fn find_by_lun(&self, lun: LunAddress) -> Option<usize> {
        self.drives
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.lun_id == Some(lun)))
    }

    fn free_index(&self) -> Option<usize> {
        self.drives.iter().enumerate().position(|(i, d)| match d {
            None => true,
            Some(d) => i == 0 && d.lun_id.is_none(),
        })
    }

    /// Places `drive` at `index`, replacing whatever was there.
    pub(super) fn install(&mut self, index: usize, drive: LogicalDrive) {
        if let Some(slot) = self.drives.get_mut(index) {
            *slot = Some(drive);
            self.recompute_highest();
        }
    }

    /// Records a volume the firmware reported. An existing entry for the
    /// same LUN is updated in place and keeps its openers.
    ///
    /// Returns the table index, or `None` when the table is full.
    pub fn upsert(&mut self, lun: LunAddress, info: VolumeInfo) -> Option<usize> {
        if let Some(index) = self.find_by_lun(lun) {
            let drive = self.get_mut(index)?;
            if !drive.matches(&info) {
                info!(drive = index, ?lun, "logical drive changed");
                drive.apply(info);
            }
            self.recompute_highest();
            return Some(index);
        }
        let index = self.free_index()?;
        let usage_count = self.get(index).map_or(0, |d| d.usage_count);
        let mut drive = LogicalDrive {
            lun_id: Some(lun),
            usage_count,
            ..LogicalDrive::default()
        };
        drive.apply(info);
        info!(
            drive = index,
            ?lun,
            blocks = drive.nr_blocks,
            raid = ?drive.raid_level,
            "logical drive added"
        );
        self.install(index, drive);
        Some(index)
    }

    /// Removes the entry at `index` unless more than `threshold` callers
    /// hold it open. Slot 0 reverts to the controller node.
    pub fn deregister(&mut self, index: usize, threshold: u32) -> Result<(), DriveError> {
        let drive = self.get(index).ok_or(DriveError::NoSuchDrive(index))?;
        if drive.usage_count > threshold {
            return Err(DriveError::InUse {
                index,
                usage: drive.usage_count,
            });
        }
        if index == 0 {
            let usage_count = drive.usage_count;
            self.drives[0] = Some(LogicalDrive {
                usage_count,
                ..LogicalDrive::controller_node()
            });
        } else {
            self.drives[index] = None;
        }
        self.recompute_highest();
        Ok(())
    }

    pub fn recompute_highest(&mut self) {
        self.highest = self
            .drives
            .iter()
            .rposition(|d| d.as_ref().is_some_and(|d| d.heads != 0));
    }

    /// Drops every volume, leaving only the controller node.
    pub fn clear(&mut self) {
        let max_luns = self.drives.len();
        *self = Self::new(max_luns);
    }

    /// Every entry carrying a volume.
    pub fn configured(&self) -> Vec<(usize, LogicalDrive)> {
        self.drives
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().filter(|d| d.heads != 0).map(|d| (i, d.clone())))
            .collect()
    }

    /// Index and LUN of every entry bound to a volume.
    pub fn lun_ids(&self) -> Vec<(usize, LunAddress)> {
        self.drives
            .iter()
            .enumerate()
            .filter_map(|(i, d)| Some((i, d.as_ref()?.lun_id?)))
            .collect()
    }

    pub fn set_busy(&mut self, index: usize, busy: bool) {
        if let Some(drive) = self.get_mut(index) {
            drive.busy_configuring = busy;
        }
    }
}

impl Controller {
    /// Brings the drive table in line with the volumes the firmware
    /// reports: drops vanished volumes, probes every reported one and
    /// records what it found.
    ///
    /// Status snapshots and drive opens are refused while this runs.
    #[tracing::instrument(skip(self), fields(controller = %self.name))]
    pub async fn rescan_topology(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            ensure!(
                !state.busy_configuring,
                "{}: configuration change already in progress",
                self.name
            );
            state.busy_configuring = true;
        }
        info!("rescan started");
        let result = self.scan().await;
        self.state.lock().busy_configuring = false;
        if result.is_ok() {
            info!("rescan finished");
        }
        result
    }

    async fn scan(&self) -> Result<()> {
        let allocation = 8 + 8 * self.config.max_luns as u32;
        let data = self
            .execute_internal(LunAddress::CONTROLLER, report_logical_luns(allocation))
            .await
            .wrap_err("REPORT LOGICAL LUNS failed")?;
        let mut luns = report_luns_response(&data)?;
        if luns.len() > self.config.max_luns {
            warn!(
                "{}: firmware reports {} volumes, only {} fit",
                self.name,
                luns.len(),
                self.config.max_luns
            );
            luns.truncate(self.config.max_luns);
        }
        debug!("{}: firmware reports {} volumes", self.name, luns.len());

        {
            let mut state = self.state.lock();
            let gone: Vec<_> = state
                .drives
                .lun_ids()
                .into_iter()
                .filter(|(_, lun)| !luns.contains(lun))
                .collect();
            for (index, lun) in gone {
                match state.drives.deregister(index, 0) {
                    Ok(()) => info!(drive = index, ?lun, "logical drive removed"),
                    Err(e) => warn!("{}: keeping vanished drive {index}: {e}", self.name),
                }
            }
        }

        for lun in luns {
            let existing = {
                let mut state = self.state.lock();
                let index = state.drives.find_by_lun(lun);
                if let Some(index) = index {
                    state.drives.set_busy(index, true);
                }
                index
            };
            let probed = self.probe_volume(lun).await;
            let mut state = self.state.lock();
            if let Some(index) = existing {
                state.drives.set_busy(index, false);
            }
            match probed {
                Ok(info) => {
                    if state.drives.upsert(lun, info).is_none() {
                        warn!("{}: no free drive slot for {lun:?}", self.name);
                    }
                }
                Err(e) => warn!("{}: could not probe {lun:?}: {e:#}", self.name),
            }
        }

        self.state.lock().drives.recompute_highest();
        Ok(())
    }

    async fn probe_volume(&self, lun: LunAddress) -> Result<VolumeInfo> {
        let data = self
            .execute_internal(lun, inquiry(INQUIRY_LEN))
            .await
            .wrap_err("INQUIRY failed")?;
        let identity = inquiry_response(&data)?;
        let (vendor, model, rev) = (identity.vendor(), identity.product(), identity.revision());

        let serial = match self
            .execute_internal(lun, inquiry_vpd(VPD_DEVICE_ID, VPD_LEN))
            .await
        {
            Ok(page) => device_id_response(&page).unwrap_or_default(),
            Err(e) => {
                debug!("{}: no device id page for {lun:?}: {e}", self.name);
                [0; DEVICE_ID_LEN]
            }
        };

        let (nr_blocks, block_size) = self.read_capacity(lun).await?;

        let geometry = match self
            .execute_internal(lun, inquiry_vpd(VPD_GEOMETRY, VPD_LEN))
            .await
        {
            Ok(page) => Geometry::parse(&page).unwrap_or_else(|e| {
                debug!("{}: unusable geometry page for {lun:?}: {e}", self.name);
                None
            }),
            Err(e) => {
                debug!("{}: no geometry page for {lun:?}: {e}", self.name);
                None
            }
        };
        let (heads, sectors, raid_level) = match geometry {
            Some(g) if g.heads != 0 && g.sectors != 0 => (g.heads, g.sectors, Some(g.raid_level)),
            _ => (DEFAULT_HEADS, DEFAULT_SECTORS, None),
        };
        let cylinders = nr_blocks.div_ceil((heads * sectors) as u64);

        Ok(VolumeInfo {
            heads,
            sectors,
            cylinders: u32::try_from(cylinders).unwrap_or(u32::MAX),
            block_size,
            nr_blocks,
            raid_level,
            vendor,
            model,
            rev,
            serial,
        })
    }

    /// Returns the block count and block size, using the 16 byte form
    /// when the volume is too large for the 10 byte one.
    async fn read_capacity(&self, lun: LunAddress) -> Result<(u64, u32)> {
        let data = self
            .execute_internal(lun, read_capacity_10())
            .await
            .wrap_err("READ CAPACITY(10) failed")?;
        let capacity = ReadCapacity10::parse(&data)?;
        if !capacity.overflowed() {
            return Ok((capacity.last_lba as u64 + 1, capacity.block_size));
        }
        let data = self
            .execute_internal(lun, read_capacity_16())
            .await
            .wrap_err("READ CAPACITY(16) failed")?;
        let capacity = ReadCapacity16::parse(&data)?;
        let nr_blocks = capacity
            .blocks()
            .ok_or_eyre("READ CAPACITY(16) reported an impossible last LBA")?;
        Ok((nr_blocks, capacity.block_size))
    }

    /// Opens a logical drive on behalf of a caller. `admin` callers may
    /// open the controller node in slot 0 even when no volume is there.
    pub fn open_drive(&self, index: usize, admin: bool) -> Result<(), DriveError> {
        let mut state = self.state.lock();
        if state.busy_configuring {
            return Err(DriveError::Busy);
        }
        let drive = state
            .drives
            .get_mut(index)
            .ok_or(DriveError::NoSuchDrive(index))?;
        if drive.busy_configuring {
            return Err(DriveError::Busy);
        }
        if drive.heads == 0 {
            if index != 0 {
                return Err(DriveError::NoSuchDrive(index));
            }
            if !admin {
                return Err(DriveError::PermissionDenied);
            }
        }
        drive.usage_count += 1;
        Ok(())
    }

    pub fn release_drive(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(drive) = state.drives.get_mut(index) {
            drive.usage_count = drive.usage_count.saturating_sub(1);
        }
    }

    /// Removes a drive at an administrator's request. The caller is
    /// expected to hold it open, so one opener is tolerated.
    pub fn deregister_drive(&self, index: usize, admin: bool) -> Result<(), DriveError> {
        if !admin {
            return Err(DriveError::PermissionDenied);
        }
        let mut state = self.state.lock();
        if state.busy_configuring {
            return Err(DriveError::Busy);
        }
        state.drives.deregister(index, 1)?;
        info!("{}: logical drive {index} deregistered", self.name);
        Ok(())
    }

    pub fn drive(&self, index: usize) -> Option<LogicalDrive> {
        self.state.lock().drives.get(index).cloned()
    }

    pub fn highest_lun(&self) -> Option<usize> {
        self.state.lock().drives.highest_lun()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::config::ControllerConfig;
    use crate::hw::sim::{Fault, SimVolume};
    use crate::scsi::OpCode;

    fn volume(blocks: u64) -> VolumeInfo {
        VolumeInfo {
            heads: 255,
            sectors: 32,
            cylinders: blocks.div_ceil(255 * 32) as u32,
            block_size: 512,
            nr_blocks: blocks,
            raid_level: Some(1),
            vendor: "HP".into(),
            model: "LOGICAL VOLUME".into(),
            rev: "OK".into(),
            serial: [0; DEVICE_ID_LEN],
        }
    }

    fn lun(index: u8) -> LunAddress {
        LunAddress([index, 0, 0, 0x40, 0, 0, 0, 0])
    }

    #[test]
    fn highest_lun_follows_deregistration() {
        let mut table = DriveTable::new(8);
        assert_eq!(table.highest_lun(), None);
        for i in 0..3 {
            assert_eq!(table.upsert(lun(i), volume(1 << 16)), Some(i as usize));
        }
        assert_eq!(table.highest_lun(), Some(2));

        table.deregister(2, 0).unwrap();
        assert_eq!(table.highest_lun(), Some(1));
        table.deregister(1, 0).unwrap();
        table.deregister(0, 0).unwrap();
        assert_eq!(table.highest_lun(), None);
        // the controller node survives
        assert!(table.get(0).is_some());
        assert_eq!(table.get(0).unwrap().lun_id, None);
    }

    #[test]
    fn open_drives_are_not_deregistered() {
        let mut table = DriveTable::new(4);
        table.upsert(lun(0), volume(4096));
        table.upsert(lun(1), volume(4096));
        table.get_mut(1).unwrap().usage_count = 1;

        assert_eq!(
            table.deregister(1, 0),
            Err(DriveError::InUse { index: 1, usage: 1 })
        );
        table.deregister(1, 1).unwrap();
        assert_eq!(table.get(1), None);
        assert_eq!(table.deregister(3, 0), Err(DriveError::NoSuchDrive(3)));
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut table = DriveTable::new(4);
        table.upsert(lun(5), volume(4096));
        table.get_mut(0).unwrap().usage_count = 2;
        assert_eq!(table.upsert(lun(5), volume(8192)), Some(0));
        let drive = table.get(0).unwrap();
        assert_eq!(drive.nr_blocks, 8192);
        assert_eq!(drive.usage_count, 2);
    }

    #[test]
    fn full_table_rejects_new_volumes() {
        let mut table = DriveTable::new(2);
        table.upsert(lun(0), volume(4096));
        table.upsert(lun(1), volume(4096));
        assert_eq!(table.upsert(lun(2), volume(4096)), None);
    }

    #[tokio::test]
    async fn rescan_discovers_and_removes_volumes() {
        let rig = testing::sim_controller(ControllerConfig::default());
        let _irq = rig.spawn_service();
        let first = rig.board.add_volume(SimVolume::new(0, 100_000));
        rig.board.add_volume(SimVolume::new(1, 20_000).without_geometry());

        rig.controller.rescan_topology().await.unwrap();
        let status = rig.controller.status().unwrap();
        assert_eq!(status.drives.len(), 2);
        assert_eq!(status.highest_lun, Some(1));

        let drive = rig.controller.drive(0).unwrap();
        assert_eq!(drive.lun_id, Some(first));
        assert_eq!(drive.nr_blocks, 100_000);
        assert_eq!(drive.raid_level, Some(5));
        assert_eq!((drive.heads, drive.sectors), (255, 32));
        assert_eq!(drive.cylinders, 13);
        assert_eq!(drive.model, "LOGICAL VOLUME");
        assert_eq!(&drive.serial, b"SIMVOL0000000000");

        let plain = rig.controller.drive(1).unwrap();
        assert_eq!(plain.raid_level, None);
        assert_eq!((plain.heads, plain.sectors), (DEFAULT_HEADS, DEFAULT_SECTORS));

        assert!(rig.board.remove_volume(first));
        rig.controller.rescan_topology().await.unwrap();
        let node = rig.controller.drive(0).unwrap();
        assert_eq!(node.lun_id, None);
        assert_eq!(rig.controller.highest_lun(), Some(1));
    }

    #[tokio::test]
    async fn open_volume_survives_removal() {
        let rig = testing::sim_controller(ControllerConfig::default());
        let _irq = rig.spawn_service();
        let lun = rig.board.add_volume(SimVolume::new(0, 4096));
        rig.controller.rescan_topology().await.unwrap();

        rig.controller.open_drive(0, false).unwrap();
        rig.board.remove_volume(lun);
        rig.controller.rescan_topology().await.unwrap();
        assert_eq!(rig.controller.drive(0).unwrap().lun_id, Some(lun));

        rig.controller.release_drive(0);
        rig.controller.rescan_topology().await.unwrap();
        assert_eq!(rig.controller.drive(0).unwrap().lun_id, None);
    }

    #[tokio::test]
    async fn failed_probe_skips_the_volume() {
        let rig = testing::sim_controller(ControllerConfig::default());
        let _irq = rig.spawn_service();
        rig.board.add_volume(SimVolume::new(0, 4096));
        rig.board.inject(
            Fault::status(crate::ciss::command_list::CommandStatus::HardwareError)
                .on_opcode(OpCode::ReadCapacity10),
        );
        rig.controller.rescan_topology().await.unwrap();
        assert_eq!(rig.controller.highest_lun(), None);
        assert!(rig.controller.status().unwrap().drives.is_empty());
    }

    #[tokio::test]
    async fn short_geometry_page_falls_back_to_defaults() {
        let rig = testing::sim_controller(ControllerConfig::default());
        let _irq = rig.spawn_service();
        rig.board.add_volume(SimVolume::new(0, 4096));
        rig.board.inject(
            Fault::status(crate::ciss::command_list::CommandStatus::DataUnderrun)
                .on_vpd_page(VPD_GEOMETRY)
                .with_residual(VPD_LEN as u32 - 4),
        );
        rig.controller.rescan_topology().await.unwrap();

        let drive = rig.controller.drive(0).unwrap();
        assert_eq!(drive.nr_blocks, 4096);
        assert_eq!((drive.heads, drive.sectors), (DEFAULT_HEADS, DEFAULT_SECTORS));
        assert_eq!(drive.raid_level, None);
        assert_eq!(drive.model, "LOGICAL VOLUME");
    }

    #[test]
    fn open_rules() {
        let (controller, _regs) = testing::controller(4);
        assert_eq!(controller.open_drive(0, false), Err(DriveError::PermissionDenied));
        controller.open_drive(0, true).unwrap();
        assert_eq!(controller.open_drive(3, true), Err(DriveError::NoSuchDrive(3)));

        testing::add_drive(&controller, 1, 4096);
        controller.state.lock().busy_configuring = true;
        assert_eq!(controller.open_drive(1, false), Err(DriveError::Busy));
        assert!(controller.status().is_err());
        controller.state.lock().busy_configuring = false;
        controller.open_drive(1, false).unwrap();

        assert_eq!(
            controller.deregister_drive(1, false),
            Err(DriveError::PermissionDenied)
        );
        controller.open_drive(1, false).unwrap();
        assert_eq!(
            controller.deregister_drive(1, true),
            Err(DriveError::InUse { index: 1, usage: 2 })
        );
        controller.release_drive(1);
        controller.deregister_drive(1, true).unwrap();
        assert_eq!(controller.highest_lun(), None);
    }
}
