//! MODE SENSE / MODE SELECT assembly and parsing
//!
//! Targets contribute their pages through `ScsiTarget::setup_mode_pages()`;
//! the functions here build the mode parameter structure (header, optional
//! block descriptor, page list) and parse MODE SELECT parameter lists,
//! including the block-size change protocol of the format device page.

use std::collections::BTreeMap;

use crate::device::target::ScsiTarget;
use crate::scsi::{
    be16, put_be16, put_be32, put_be64, Asc, CmdOutput, CmdResult, ScsiCommand, ScsiError,
    SenseKey, Status,
};

/// Custom mode page data loaded from the properties file, keyed by vendor,
/// product and page code. A `None` vendor or product matches any device; an
/// empty data vector suppresses the page entirely.
#[derive(Debug, Default)]
pub struct ModePageOverrides {
    entries: Vec<OverrideEntry>,
}

#[derive(Debug)]
struct OverrideEntry {
    vendor: Option<String>,
    product: Option<String>,
    page: u8,
    data: Vec<u8>,
}

impl ModePageOverrides {
    pub fn add(&mut self, vendor: Option<&str>, product: Option<&str>, page: u8, data: Vec<u8>) {
        self.entries.push(OverrideEntry {
            vendor: vendor.map(str::to_string),
            product: product.map(str::to_string),
            page,
            data,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All overriding pages applying to the given device
    pub fn pages_for(&self, vendor: &str, product: &str) -> BTreeMap<u8, Vec<u8>> {
        let mut pages = BTreeMap::new();
        for entry in &self.entries {
            let vendor_match = entry.vendor.as_deref().map_or(true, |v| v == vendor);
            let product_match = entry.product.as_deref().map_or(true, |p| p == product);
            if vendor_match && product_match {
                pages.insert(entry.page, entry.data.clone());
            }
        }
        pages
    }
}

pub fn mode_sense<T: ScsiTarget + ?Sized>(
    target: &T,
    opcode: ScsiCommand,
    cdb: &[u8; 16],
) -> Result<Vec<u8>, ScsiError> {
    let ms10 = opcode == ScsiCommand::ModeSense10;

    let allocation_length = if ms10 {
        be16(&cdb[7..9]) as usize
    } else {
        cdb[4] as usize
    };
    let dbd = cdb[1] & 0x08 != 0;
    let llbaa = cdb[1] & 0x10 != 0;
    let changeable = cdb[2] & 0xC0 == 0x40;
    let page = cdb[2] & 0x3F;

    let device_specific = if target.device().write_protected {
        0x80
    } else {
        0x00
    };

    let mut buf = vec![0u8; if ms10 { 8 } else { 4 }];
    if ms10 {
        buf[2] = target.ms_media_type();
        buf[3] = device_specific;
    } else {
        buf[1] = target.ms_media_type();
        buf[2] = device_specific;
    }

    // Add the block descriptor if DBD is 0, only when a medium is present
    if !dbd && target.device().ready {
        if let Some((blocks, block_size)) = target.block_descriptor() {
            if ms10 && llbaa && blocks > u64::from(u32::MAX) {
                // Long LBA mode parameter block descriptor
                buf[4] = 0x01;
                buf[7] = 0x10;

                let mut bd = [0u8; 16];
                put_be64(&mut bd[0..8], blocks);
                put_be32(&mut bd[12..16], block_size);
                buf.extend_from_slice(&bd);
            } else {
                // Short LBA mode parameter block descriptor
                if ms10 {
                    buf[7] = 0x08;
                } else {
                    buf[3] = 0x08;
                }

                let mut bd = [0u8; 8];
                put_be32(&mut bd[0..4], blocks.min(u64::from(u32::MAX)) as u32);
                put_be32(&mut bd[4..8], block_size);
                buf.extend_from_slice(&bd);
            }
        }
    }

    add_mode_pages(
        target,
        &mut buf,
        page,
        changeable,
        if ms10 { 65535 } else { 255 },
    )?;

    // The size fields do not count themselves. They are set from the
    // complete structure; truncation to the allocation length happens last.
    if ms10 {
        let len = (buf.len() - 2) as u16;
        put_be16(&mut buf[0..2], len);
    } else {
        buf[0] = (buf.len() - 1) as u8;
    }

    buf.truncate(allocation_length);
    Ok(buf)
}

fn add_mode_pages<T: ScsiTarget + ?Sized>(
    target: &T,
    buf: &mut Vec<u8>,
    page: u8,
    changeable: bool,
    max_size: usize,
) -> Result<(), ScsiError> {
    let mut pages = BTreeMap::new();
    target.setup_mode_pages(&mut pages, page, changeable);

    if let Some(overrides) = target.custom_mode_pages() {
        let dev = target.device();
        for (p, data) in overrides.pages_for(dev.vendor(), dev.product()) {
            if page != 0x3F && p != page {
                continue;
            }
            if data.is_empty() {
                pages.remove(&p);
            } else {
                pages.insert(p, data);
            }
        }
    }

    if pages.is_empty() {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::InvalidFieldInCdb,
        ));
    }

    let mut result = Vec::new();

    for (&code, data) in pages.iter().filter(|&(&code, _)| code != 0) {
        let off = result.len();
        result.extend_from_slice(data);
        // Page code; the PS bit may already have been set by the target
        result[off] |= code;
        // The page size does not count itself and the page code field
        result[off + 1] = (data.len() - 2) as u8;
    }

    // Page 0, if present, must be returned last and has no size field
    if let Some(data) = pages.get(&0) {
        result.extend_from_slice(data);
    }

    if result.len() > max_size {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::InvalidFieldInCdb,
        ));
    }

    buf.extend_from_slice(&result);
    Ok(())
}

/// MODE SELECT entry point. The first call announces the DATA OUT transfer;
/// the second call carries the parameter list.
pub fn mode_select<T: ScsiTarget + ?Sized>(
    target: &mut T,
    opcode: ScsiCommand,
    cdb: &[u8; 16],
    outdata: Option<&[u8]>,
) -> CmdResult {
    let ms10 = opcode == ScsiCommand::ModeSelect10;
    let length = if ms10 {
        be16(&cdb[7..9]) as usize
    } else {
        cdb[4] as usize
    };

    let Some(data) = outdata else {
        // Save-parameters support is checked before the transfer starts
        if !target.supports_save_parameters() && cdb[1] & 0x01 != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }
        return Ok(CmdOutput::DataOut(length));
    };

    apply_mode_select(target, opcode, cdb, &data[..length.min(data.len())])?;
    Ok(CmdOutput::Status(Status::Good))
}

fn apply_mode_select<T: ScsiTarget + ?Sized>(
    target: &mut T,
    opcode: ScsiCommand,
    cdb: &[u8; 16],
    buf: &[u8],
) -> Result<(), ScsiError> {
    // Vendor-specific parameters (PF=0, SCSI-1) are not supported, but no
    // error is reported in order to support Apple's HD SC Setup
    if cdb[1] & 0x10 == 0 {
        log::debug!("MODE SELECT with PF=0 accepted for compatibility");
        return Ok(());
    }

    // The parameter list is optional
    if buf.is_empty() {
        return Ok(());
    }

    let mut size = target.block_size().unwrap_or(0);

    let mut offset = evaluate_block_descriptors(target, opcode, buf, &mut size)?;

    let mut pages = BTreeMap::new();
    target.setup_mode_pages(&mut pages, 0x3F, true);

    while offset < buf.len() {
        if buf.len() - offset < 2 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::ParameterListLengthError,
            ));
        }

        let page_code = buf[offset] & 0x3F;
        let Some(expected) = pages.get(&page_code) else {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInParameterList,
            ));
        };

        // The page size field does not count itself and the page code field
        let page_size = buf[offset + 1] as usize + 2;
        if expected.len() != page_size {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInParameterList,
            ));
        }
        if page_size > buf.len() - offset {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::ParameterListLengthError,
            ));
        }

        match page_code {
            // Changes to the error recovery and caching pages are not
            // relevant for the emulation and are accepted silently
            0x01 | 0x07 | 0x08 => (),

            // Format device page, carries the block size for a subsequent
            // FORMAT. A deviating size is a permanent change request.
            0x03 => {
                let requested = u32::from(be16(&buf[offset + 12..offset + 14]));
                size = target.verify_block_size_change(requested, false)?;
            }

            _ => {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidFieldInParameterList,
                ));
            }
        }

        offset += page_size;
    }

    if size != 0 {
        target.change_block_size(size)?;
    }

    Ok(())
}

/// Parses the block descriptors in a MODE SELECT parameter list; returns the
/// offset of the first page descriptor. A deviating block size in the first
/// descriptor is a temporary change request.
fn evaluate_block_descriptors<T: ScsiTarget + ?Sized>(
    target: &T,
    opcode: ScsiCommand,
    buf: &[u8],
    size: &mut u32,
) -> Result<usize, ScsiError> {
    let header_length = if opcode == ScsiCommand::ModeSelect10 {
        8
    } else {
        4
    };

    if buf.len() < header_length {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::ParameterListLengthError,
        ));
    }

    let descriptor_length = if opcode == ScsiCommand::ModeSelect10 {
        be16(&buf[6..8]) as usize
    } else {
        buf[3] as usize
    };

    if buf.len() < descriptor_length + header_length {
        return Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::ParameterListLengthError,
        ));
    }

    if descriptor_length != 0 && buf.len() >= header_length + 8 {
        let requested = u32::from(be16(&buf[header_length + 6..header_length + 8]));
        *size = target.verify_block_size_change(requested, true)?;
    }

    Ok(descriptor_length + header_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceType};

    struct PagedTarget {
        dev: Device,
        overrides: Option<ModePageOverrides>,
    }

    impl PagedTarget {
        fn new() -> Self {
            let mut dev = Device::new(DeviceType::Hd, 0);
            dev.set_product("PAGED", false).unwrap();
            dev.ready = true;
            Self {
                dev,
                overrides: None,
            }
        }
    }

    impl ScsiTarget for PagedTarget {
        fn device(&self) -> &Device {
            &self.dev
        }

        fn device_mut(&mut self) -> &mut Device {
            &mut self.dev
        }

        fn supports_mode_pages(&self) -> bool {
            true
        }

        fn custom_mode_pages(&self) -> Option<&ModePageOverrides> {
            self.overrides.as_ref()
        }

        fn block_descriptor(&self) -> Option<(u64, u32)> {
            Some((1024, 512))
        }

        fn block_size(&self) -> Option<u32> {
            Some(512)
        }

        fn setup_mode_pages(&self, pages: &mut BTreeMap<u8, Vec<u8>>, page: u8, _ch: bool) {
            if page == 0x01 || page == 0x3F {
                pages.insert(0x01, vec![0u8; 12]);
            }
            if page == 0x03 || page == 0x3F {
                let mut buf = vec![0u8; 24];
                put_be16(&mut buf[12..14], 512);
                pages.insert(0x03, buf);
            }
            if page == 0x08 || page == 0x3F {
                pages.insert(0x08, vec![0u8; 12]);
            }
            if page == 0x00 || page == 0x3F {
                pages.insert(0x00, vec![0u8; 4]);
            }
        }

        fn verify_block_size_change(&self, requested: u32, temporary: bool) -> Result<u32, ScsiError> {
            if requested == 512 {
                return Ok(requested);
            }
            if requested != 0 && requested % 4 == 0 && temporary {
                return Ok(requested);
            }
            Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInParameterList,
            ))
        }
    }

    fn cdb(bytes: &[u8]) -> [u8; 16] {
        let mut c = [0u8; 16];
        c[..bytes.len()].copy_from_slice(bytes);
        c
    }

    #[test]
    fn mode_sense6_layout() {
        let t = PagedTarget::new();
        let buf = mode_sense(&t, ScsiCommand::ModeSense6, &cdb(&[0x1A, 0, 0x3F, 0, 0xFF, 0]))
            .unwrap();

        // Block descriptor present
        assert_eq!(buf[3], 0x08);
        assert_eq!(crate::scsi::be32(&buf[4..8]), 1024);
        assert_eq!(crate::scsi::be32(&buf[8..12]), 512);

        // Mode data length does not count itself
        assert_eq!(buf[0] as usize, buf.len() - 1);

        // Page 0 comes last: locate it after the sized pages
        let mut offset = 12;
        let mut codes = vec![];
        while offset + 1 < buf.len() {
            let code = buf[offset] & 0x3F;
            codes.push(code);
            if code == 0 {
                break;
            }
            offset += buf[offset + 1] as usize + 2;
        }
        assert_eq!(codes, vec![0x01, 0x03, 0x08, 0x00]);
    }

    #[test]
    fn mode_sense6_dbd_suppresses_descriptor() {
        let t = PagedTarget::new();
        let buf = mode_sense(&t, ScsiCommand::ModeSense6, &cdb(&[0x1A, 0x08, 0x01, 0, 0xFF, 0]))
            .unwrap();
        assert_eq!(buf[3], 0x00);
        assert_eq!(buf[4] & 0x3F, 0x01);
    }

    #[test]
    fn mode_sense6_truncates_after_assembly() {
        let t = PagedTarget::new();
        let buf = mode_sense(&t, ScsiCommand::ModeSense6, &cdb(&[0x1A, 0, 0x3F, 0, 4, 0]))
            .unwrap();
        assert_eq!(buf.len(), 4);
        // The length field still reflects the untruncated structure
        assert!(buf[0] as usize > 4);
    }

    #[test]
    fn mode_sense_unknown_page() {
        let t = PagedTarget::new();
        let e = mode_sense(&t, ScsiCommand::ModeSense6, &cdb(&[0x1A, 0, 0x2A, 0, 0xFF, 0]))
            .unwrap_err();
        assert_eq!(e.asc, Asc::InvalidFieldInCdb);
    }

    #[test]
    fn custom_page_suppression() {
        let mut t = PagedTarget::new();
        let mut overrides = ModePageOverrides::default();
        overrides.add(None, Some("PAGED"), 0x08, vec![]);
        t.overrides = Some(overrides);

        let e = mode_sense(&t, ScsiCommand::ModeSense6, &cdb(&[0x1A, 0, 0x08, 0, 0xFF, 0]))
            .unwrap_err();
        assert_eq!(e.asc, Asc::InvalidFieldInCdb);
    }

    #[test]
    fn custom_page_override() {
        let mut t = PagedTarget::new();
        let mut overrides = ModePageOverrides::default();
        overrides.add(Some("DRIFT"), None, 0x30, vec![0x00, 0x00, 1, 2, 3, 4]);
        t.overrides = Some(overrides);

        let buf = mode_sense(&t, ScsiCommand::ModeSense6, &cdb(&[0x1A, 0x08, 0x30, 0, 0xFF, 0]))
            .unwrap();
        assert_eq!(buf[4] & 0x3F, 0x30);
        assert_eq!(buf[5], 4);
        assert_eq!(&buf[6..10], &[1, 2, 3, 4]);
    }

    #[test]
    fn mode_select_pf0_accepted() {
        let mut t = PagedTarget::new();
        let c = cdb(&[0x15, 0x00, 0, 0, 8, 0]);
        let r = mode_select(&mut t, ScsiCommand::ModeSelect6, &c, Some(&[0u8; 8])).unwrap();
        assert!(matches!(r, CmdOutput::Status(Status::Good)));
    }

    #[test]
    fn mode_select_rejects_unknown_page() {
        let mut t = PagedTarget::new();
        let c = cdb(&[0x15, 0x10, 0, 0, 8, 0]);
        // No block descriptor, one unknown page 0x2A
        let data = [0, 0, 0, 0, 0x2A, 2, 0, 0];
        let e = mode_select(&mut t, ScsiCommand::ModeSelect6, &c, Some(&data)).unwrap_err();
        assert_eq!(e.asc, Asc::InvalidFieldInParameterList);
    }

    #[test]
    fn mode_select_rejects_size_mismatch() {
        let mut t = PagedTarget::new();
        let c = cdb(&[0x15, 0x10, 0, 0, 6, 0]);
        // Page 1 with wrong size (4 instead of 12)
        let data = [0, 0, 0, 0, 0x01, 2, 0, 0];
        let e = mode_select(&mut t, ScsiCommand::ModeSelect6, &c, Some(&data)).unwrap_err();
        assert_eq!(e.asc, Asc::InvalidFieldInParameterList);
    }

    #[test]
    fn mode_select_accepts_recovery_and_caching_pages() {
        let mut t = PagedTarget::new();
        let mut data = vec![0u8, 0, 0, 0];
        data.extend_from_slice(&[0x01, 10]);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(&[0x08, 10]);
        data.extend_from_slice(&[0u8; 10]);

        let c = cdb(&[0x15, 0x10, 0, 0, data.len() as u8, 0]);
        let r = mode_select(&mut t, ScsiCommand::ModeSelect6, &c, Some(&data)).unwrap();
        assert!(matches!(r, CmdOutput::Status(Status::Good)));
    }

    #[test]
    fn mode_select_announces_transfer() {
        let mut t = PagedTarget::new();
        let c = cdb(&[0x15, 0x10, 0, 0, 24, 0]);
        let r = mode_select(&mut t, ScsiCommand::ModeSelect6, &c, None).unwrap();
        assert!(matches!(r, CmdOutput::DataOut(24)));
    }
}
