//! Representations for responses to SCSI commands.

use color_eyre::eyre::ensure;

use crate::ciss::command_list::LunAddress;

/// Allocation length used for standard INQUIRY.
pub const INQUIRY_LEN: u8 = 36;
/// Allocation length used for the geometry and device id VPD pages.
pub const VPD_LEN: u8 = 64;
/// Offset of the 16 byte unique identifier inside the device id page.
const DEVICE_ID_OFFSET: usize = 8;
pub const DEVICE_ID_LEN: usize = 16;
/// Geometry page value meaning "this volume cannot report geometry".
const GEOMETRY_UNSUPPORTED: u8 = 0xff;

#[repr(C, packed)]
pub struct Inquiry {
    /// Contains both the PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE TYPE (bits 4:0)
    /// fields.
    ///
    /// (see SPC-2 table 47 for exact definitions).
    pub peripheral_info: u8,
    pub removable: u8,
    pub version: u8,
    pub response_format: u8,
    pub additional_length: u8,
    flags: [u8; 3],
    /// T10 vendor identification, space padded ASCII.
    pub vendor: [u8; 8],
    /// Product identification, space padded ASCII.
    pub product: [u8; 16],
    /// Product revision level. For the controller itself this is the
    /// firmware version.
    pub revision: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<Inquiry>() == INQUIRY_LEN as usize);

impl Inquiry {
    pub fn vendor(&self) -> String {
        ascii_field(&self.vendor)
    }

    pub fn product(&self) -> String {
        ascii_field(&self.product)
    }

    pub fn revision(&self) -> String {
        ascii_field(&self.revision)
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

pub fn inquiry_response(buf: &[u8]) -> color_eyre::Result<&Inquiry> {
    ensure!(
        buf.len() >= std::mem::size_of::<Inquiry>(),
        "standard inquiry data is {} bytes, expected at least {}",
        buf.len(),
        std::mem::size_of::<Inquiry>()
    );
    // SAFETY: the slice holds at least a full struct, and a packed struct
    // has no alignment requirement
    let s: &'_ Inquiry = unsafe { &*(buf.as_ptr() as *const Inquiry) };
    Ok(s)
}

/// READ CAPACITY(10) parameter data, SBC-2 table 28.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCapacity10 {
    pub last_lba: u32,
    pub block_size: u32,
}

impl ReadCapacity10 {
    pub fn parse(buf: &[u8]) -> color_eyre::Result<Self> {
        ensure!(buf.len() >= 8, "READ CAPACITY(10) data too short: {}", buf.len());
        Ok(Self {
            last_lba: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            block_size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// The volume is too large for this form and READ CAPACITY(16) must
    /// be used instead.
    pub fn overflowed(&self) -> bool {
        self.last_lba == u32::MAX
    }
}

/// READ CAPACITY(16) parameter data, SBC-2 table 30.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCapacity16 {
    pub last_lba: u64,
    pub block_size: u32,
}

impl ReadCapacity16 {
    pub fn parse(buf: &[u8]) -> color_eyre::Result<Self> {
        ensure!(buf.len() >= 12, "READ CAPACITY(16) data too short: {}", buf.len());
        let mut lba = [0u8; 8];
        lba.copy_from_slice(&buf[..8]);
        Ok(Self {
            last_lba: u64::from_be_bytes(lba),
            block_size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Block count, or `None` when the last LBA leaves no room for one more.
    pub fn blocks(&self) -> Option<u64> {
        self.last_lba.checked_add(1)
    }
}

/// Parses REPORT LOGICAL LUNS data.
///
/// The list length header counts bytes, not entries, and may describe more
/// entries than fit in the allocation; only the entries actually present
/// are returned.
pub fn report_luns_response(buf: &[u8]) -> color_eyre::Result<Vec<LunAddress>> {
    ensure!(
        buf.len() >= 8,
        "REPORT LUNS data shorter than its header: {}",
        buf.len()
    );
    let list_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    ensure!(
        list_len % 8 == 0,
        "REPORT LUNS list length {list_len} is not a multiple of 8"
    );
    let available = (buf.len() - 8) / 8;
    let luns = buf[8..]
        .chunks_exact(8)
        .take((list_len / 8).min(available))
        .map(|entry| {
            let mut addr = [0u8; 8];
            addr.copy_from_slice(entry);
            LunAddress(addr)
        })
        .collect();
    Ok(luns)
}

/// Heads/sectors/cylinders and RAID level from the geometry VPD page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub heads: u32,
    pub sectors: u32,
    pub cylinders: u32,
    pub raid_level: u8,
}

impl Geometry {
    /// Reads the geometry page, or returns `None` when the volume reports
    /// that it cannot supply geometry.
    pub fn parse(buf: &[u8]) -> color_eyre::Result<Option<Self>> {
        ensure!(buf.len() >= 9, "geometry page too short: {}", buf.len());
        if buf[8] == GEOMETRY_UNSUPPORTED {
            return Ok(None);
        }
        Ok(Some(Self {
            heads: buf[6] as u32,
            sectors: buf[7] as u32,
            cylinders: u16::from_be_bytes([buf[4], buf[5]]) as u32,
            raid_level: buf[8],
        }))
    }
}

/// Extracts the 16 byte unique identifier from the device id page.
pub fn device_id_response(buf: &[u8]) -> color_eyre::Result<[u8; DEVICE_ID_LEN]> {
    ensure!(
        buf.len() >= DEVICE_ID_OFFSET + DEVICE_ID_LEN,
        "device id page too short: {}",
        buf.len()
    );
    let mut id = [0u8; DEVICE_ID_LEN];
    id.copy_from_slice(&buf[DEVICE_ID_OFFSET..DEVICE_ID_OFFSET + DEVICE_ID_LEN]);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_luns_honours_list_length() {
        let mut buf = vec![0, 0, 0, 16, 0, 0, 0, 0];
        buf.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]);
        buf.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 0]);
        // trailing garbage beyond the advertised list
        buf.extend_from_slice(&[3, 0, 0, 0, 0, 0, 0, 0]);
        let luns = report_luns_response(&buf).unwrap();
        assert_eq!(luns.len(), 2);
        assert_eq!(luns[1].0[0], 2);
    }

    #[test]
    fn report_luns_truncated_by_allocation() {
        let mut buf = vec![0, 0, 0, 24, 0, 0, 0, 0];
        buf.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]);
        let luns = report_luns_response(&buf).unwrap();
        assert_eq!(luns.len(), 1);
    }

    #[test]
    fn report_luns_rejects_odd_length() {
        let buf = [0, 0, 0, 5, 0, 0, 0, 0];
        let e = report_luns_response(&buf).expect_err("length not a multiple of 8");
        assert!(e.root_cause().to_string().contains("multiple of 8"));
    }

    #[test]
    fn geometry_unsupported_marker() {
        let mut page = [0u8; 16];
        page[8] = 0xff;
        assert_eq!(Geometry::parse(&page).unwrap(), None);

        page[4..6].copy_from_slice(&1000u16.to_be_bytes());
        page[6] = 255;
        page[7] = 32;
        page[8] = 5;
        let geometry = Geometry::parse(&page).unwrap().unwrap();
        assert_eq!(geometry.cylinders, 1000);
        assert_eq!(geometry.raid_level, 5);
    }

    #[test]
    fn inquiry_fields_are_trimmed() {
        let mut buf = [b' '; 36];
        buf[..8].fill(0);
        buf[8..10].copy_from_slice(b"HP");
        buf[16..25].copy_from_slice(b"LOGICAL V");
        buf[32..36].copy_from_slice(b"7.22");
        let inquiry = inquiry_response(&buf).unwrap();
        assert_eq!(inquiry.vendor(), "HP");
        assert_eq!(inquiry.product(), "LOGICAL V");
        assert_eq!(inquiry.revision(), "7.22");
    }

    #[test]
    fn capacity_16_rejects_an_unaddressable_last_lba() {
        let mut buf = vec![0xff; 8];
        buf.extend_from_slice(&512u32.to_be_bytes());
        let capacity = ReadCapacity16::parse(&buf).unwrap();
        assert_eq!(capacity.blocks(), None);

        buf[..8].copy_from_slice(&(u32::MAX as u64 + 9).to_be_bytes());
        let capacity = ReadCapacity16::parse(&buf).unwrap();
        assert_eq!(capacity.blocks(), Some(u32::MAX as u64 + 10));
    }

    #[test]
    fn short_inquiry_is_rejected() {
        let Err(e) = inquiry_response(&[0u8; 10]) else {
            panic!("short buffer was accepted");
        };
        assert!(e.root_cause().to_string().contains("standard inquiry"));
    }
}
