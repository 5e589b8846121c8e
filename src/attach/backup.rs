//! Low-page backup recovery for MLC/TLC paired-page corruption.
//!
//! On MLC NAND, a power cut while programming a high page can silently
//! corrupt the low page it is paired with, even though that page was
//! written long before. To defend against this, a dedicated internal
//! volume of exactly two LEBs keeps a rolling log of recently written low
//! pages: the page content goes into the log LEB's data area, and a
//! descriptor naming the source goes into the spare area of the same page.
//!
//! During attach, after the main scan, this pass replays the newest log
//! records: if a backed-up source page (or its paired high page) no longer
//! reads cleanly, the source PEB is rebuilt from its surviving data plus
//! the backed-up pages, onto a fresh PEB taken from the early allocator.

use deku::{DekuContainerRead, DekuContainerWrite, DekuRead, DekuUpdate, DekuWrite};
use tracing::{debug, error, info, warn};

use crate::error::Result as AttachResult;
use crate::headers::{Vid, VolType, BACKUP_VOLUME_ID, UBI_CRC, VID_HDR_SIZE};
use crate::medium::{is_all, Medium};

use super::info::{AttachInfo, PebRecord, Queue};
use super::{AttachOptions, IO_RETRIES};

/// Spare-area descriptor of one backed-up page (big-endian).
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct BackupSpare {
    /// Number of pages in the group this record closes.
    pub num: u16,
    /// Source PEB the backed-up page belongs to.
    pub pnum: u16,
    /// Source LEB number.
    pub lnum: u16,
    /// Source page index within the PEB.
    pub page: u16,
    /// Source volume.
    pub vol_id: u32,
    /// Sequence number at the time of the backup.
    pub sqnum: u64,
    /// CRC over all preceding bytes of this record.
    pub crc: u32,
}

/// On-flash size of a [`BackupSpare`] record.
pub const BACKUP_SPARE_SIZE: usize = 24;

impl BackupSpare {
    /// Decode a record from spare-area bytes, rejecting CRC mismatches.
    pub fn decode(oob: &[u8]) -> Option<Self> {
        if oob.len() < BACKUP_SPARE_SIZE {
            return None;
        }
        let (_, spare) = Self::from_bytes((oob, 0)).ok()?;
        let crc = UBI_CRC.checksum(&oob[..BACKUP_SPARE_SIZE - 4]);
        (crc == spare.crc).then_some(spare)
    }

    /// Fill in the CRC field.
    pub fn seal(mut self) -> Self {
        let bytes = self.to_bytes().unwrap();
        self.crc = UBI_CRC.checksum(&bytes[..BACKUP_SPARE_SIZE - 4]);
        self
    }
}

/// Find the byte offset of the first empty page of `pnum` by binary
/// search. A page is empty iff its data and spare regions are all 0xFF.
/// Unreadable pages count as non-empty.
fn first_empty_offset<M: Medium + ?Sized>(
    medium: &M,
    pnum: u32,
    data: &mut [u8],
    oob: &mut [u8],
) -> usize {
    let page_size = medium.min_io_size();
    let mut low = (medium.data_offset() / page_size) as i64;
    let mut high = (medium.peb_size() / page_size) as i64 - 1;
    let mut first = medium.peb_size();

    while low <= high {
        let mid = (low + high) / 2;
        let offset = mid as usize * page_size;
        let readable = medium
            .read_oob(Some(&mut data[..]), Some(&mut oob[..]), pnum, offset)
            .is_ok();
        if readable && is_all(data, 0xFF) && is_all(oob, 0xFF) {
            first = offset;
            high = mid - 1;
        } else {
            low = mid + 1;
        }
    }
    first
}

fn drain_waiting(ai: &mut AttachInfo) {
    while let Some(rec) = ai.waiting.pop_back() {
        debug!(pnum = rec.pnum, "move to erase from waiting");
        ai.add_to_list(rec, true, Queue::Erase);
    }
}

/// Run the recovery pass. Called after the main scan when the low-page
/// backup feature is enabled; always drains the `waiting` queue into
/// `erase` before returning successfully.
pub(super) fn backup_init_scan<M: Medium>(
    medium: &mut M,
    ai: &mut AttachInfo,
    opts: &AttachOptions,
) -> AttachResult<()> {
    let page_size = medium.min_io_size();
    let oob_avail = medium.oob_avail();

    if oob_avail < BACKUP_SPARE_SIZE {
        debug!("medium has no usable spare area, skipping backup recovery");
        drain_waiting(ai);
        return Ok(());
    }

    let Some(av) = ai.find_volume(BACKUP_VOLUME_ID) else {
        info!("backup volume not found");
        drain_waiting(ai);
        return Ok(());
    };

    let mut backup: [Option<PebRecord>; 2] = [None, None];
    for (&lnum, rec) in &av.lebs {
        if lnum < 2 {
            backup[lnum as usize] = Some(rec.clone());
        } else {
            warn!(lnum, pnum = rec.pnum, "backup volume has an impossible LEB");
        }
    }

    let mut data = vec![0u8; page_size];
    let mut oob = vec![0u8; oob_avail];

    // Find where each log ends and read its newest record.
    let mut next_offset = [0usize; 2];
    let mut newest: [Option<BackupSpare>; 2] = [None, None];
    for j in 0..2 {
        let Some(rec) = &backup[j] else { continue };
        next_offset[j] = first_empty_offset(medium, rec.pnum, &mut data, &mut oob);
        debug!(
            lnum = j,
            pnum = rec.pnum,
            next_offset = next_offset[j],
            "backup log tail"
        );
        if next_offset[j] <= medium.data_offset() {
            continue;
        }
        let offset = next_offset[j] - page_size;
        if medium
            .read_oob(None, Some(&mut oob[..]), rec.pnum, offset)
            .is_err()
        {
            debug!(pnum = rec.pnum, "newest backup page unreadable, log ignored");
            continue;
        }
        match BackupSpare::decode(&oob) {
            Some(spare) => {
                if ai.max_sqnum < spare.sqnum {
                    ai.max_sqnum = spare.sqnum;
                }
                newest[j] = Some(spare);
            }
            None => debug!(pnum = rec.pnum, "newest backup record fails its CRC, log ignored"),
        }
    }

    // When both logs end on the same source PEB, only the newer entry
    // still matters.
    if let (Some(a), Some(b)) = (newest[0], newest[1]) {
        if a.pnum == b.pnum {
            if b.sqnum > a.sqnum {
                newest[0] = None;
            } else {
                newest[1] = None;
            }
        }
    }

    for j in [1usize, 0] {
        let (Some(rec), Some(head)) = (backup[j].clone(), newest[j]) else {
            continue;
        };
        process_log(
            medium,
            ai,
            opts,
            rec.pnum,
            next_offset[j],
            head,
            &mut data,
            &mut oob,
        )?;
    }

    drain_waiting(ai);
    Ok(())
}

/// Walk the newest record group of one backup log and rebuild the source
/// PEB if any backed-up page (or its paired high page) is damaged.
#[allow(clippy::too_many_arguments)]
fn process_log<M: Medium>(
    medium: &mut M,
    ai: &mut AttachInfo,
    opts: &AttachOptions,
    backup_pnum: u32,
    next_offset: usize,
    head: BackupSpare,
    data: &mut [u8],
    oob: &mut [u8],
) -> AttachResult<()> {
    let page_size = medium.min_io_size();

    // Collect the whole group first: descriptors plus the backed-up page
    // contents they sit next to.
    let mut group: Vec<BackupSpare> = Vec::new();
    let mut overlays: Vec<(u32, Vec<u8>)> = Vec::new();
    for i in 0..head.num as usize {
        let offset = match next_offset.checked_sub((i + 1) * page_size) {
            Some(offset) if offset >= medium.data_offset() => offset,
            _ => break,
        };
        if medium
            .read_oob(Some(&mut data[..]), Some(&mut oob[..]), backup_pnum, offset)
            .is_err()
        {
            debug!(backup_pnum, offset, "backup page unreadable, stopping walk");
            break;
        }
        let Some(spare) = BackupSpare::decode(oob) else {
            debug!(backup_pnum, offset, "backup record fails its CRC, skipped");
            continue;
        };
        overlays.push((u32::from(spare.page), data.to_vec()));
        group.push(spare);
    }

    // Now decide whether any of the referenced source pages is damaged.
    let mut corrupt = false;
    for spare in &group {
        let source_pnum = u32::from(spare.pnum);
        let source_offset = usize::from(spare.page) * page_size;

        match medium.read_oob(Some(&mut data[..]), None, source_pnum, source_offset) {
            Ok(cond) if !cond.bitflips() => {}
            _ => {
                info!(source_pnum, page = spare.page, "backed-up source page is damaged");
                corrupt = true;
                break;
            }
        }

        let Some(high) = medium.paired_page(u32::from(spare.page)) else {
            continue;
        };
        match medium.read_oob(Some(&mut data[..]), None, source_pnum, high as usize * page_size) {
            Ok(cond) if !cond.bitflips() => {}
            _ => {
                info!(source_pnum, high, "paired high page is damaged");
                corrupt = true;
                break;
            }
        }
        if is_all(data, 0xFF) {
            // The paired high page never made it to flash. If the copy of
            // this PEB in the snapshot predates the backup record, the low
            // page cannot be trusted either.
            let stale = ai
                .find_volume(spare.vol_id)
                .and_then(|av| av.lebs.values().find(|r| r.pnum == source_pnum))
                .is_some_and(|r| r.sqnum < spare.sqnum);
            if stale {
                info!(source_pnum, "high page empty and snapshot is older than the backup");
                corrupt = true;
                break;
            }
        }
    }

    if corrupt {
        recover_peb(medium, ai, opts, &head, &overlays)?;
    }
    Ok(())
}

/// Rebuild the source PEB named by `spare` onto a fresh PEB: surviving
/// source data, overlaid with the backed-up pages, CRC-protected and
/// written with the copy flag set.
fn recover_peb<M: Medium>(
    medium: &mut M,
    ai: &mut AttachInfo,
    opts: &AttachOptions,
    spare: &BackupSpare,
    overlays: &[(u32, Vec<u8>)],
) -> AttachResult<()> {
    let source_pnum = u32::from(spare.pnum);
    let source_lnum = u32::from(spare.lnum);
    let vol_id = spare.vol_id;

    let Some(av) = ai.find_volume(vol_id) else {
        warn!(vol_id, "backup record references an unknown volume");
        return Ok(());
    };
    let (data_pad, av_compat, av_used_ebs) = (av.data_pad, av.compat, av.used_ebs);

    // Where does the snapshot hold the source PEB right now?
    let from_volume = av
        .lebs
        .get(&source_lnum)
        .filter(|r| r.pnum == source_pnum)
        .cloned();
    let in_volume = from_volume.is_some();
    let old = if let Some(rec) = from_volume {
        rec
    } else if let Some(pos) = ai.corr.iter().position(|r| r.pnum == source_pnum) {
        ai.corr_peb_count -= 1;
        ai.corr.remove(pos).expect("position valid")
    } else if let Some(pos) = ai.waiting.iter().position(|r| r.pnum == source_pnum) {
        ai.waiting.remove(pos).expect("position valid")
    } else if let Some(pos) = ai.free.iter().position(|r| r.pnum == source_pnum) {
        // The LEB has been rewritten elsewhere since the backup was taken;
        // the stale PEB only needs a fresh erase.
        let rec = ai.free.remove(pos).expect("position valid");
        info!(pnum = rec.pnum, "moving stale PEB from free to erase");
        ai.add_to_list(rec, true, Queue::Erase);
        return Ok(());
    } else if let Some(pos) = ai.alien.iter().position(|r| r.pnum == source_pnum) {
        let rec = ai.alien.remove(pos).expect("position valid");
        ai.alien_peb_count -= 1;
        info!(pnum = rec.pnum, "moving stale PEB from alien to erase");
        ai.add_to_list(rec, true, Queue::Erase);
        return Ok(());
    } else {
        debug!(source_pnum, "source PEB is not in the snapshot, nothing to do");
        return Ok(());
    };

    // Rebuild the LEB image: whatever still reads from the source PEB,
    // with the backed-up pages laid over it.
    let page_size = medium.min_io_size();
    let data_offset = medium.data_offset();
    let data_size = medium.leb_size() - data_pad as usize;

    let mut buf = vec![0xFF_u8; data_size];
    for offset in (0..data_size).step_by(page_size) {
        let len = page_size.min(data_size - offset);
        if let Err(err) = medium.read(&mut buf[offset..offset + len], source_pnum, data_offset + offset)
        {
            warn!(pnum = source_pnum, offset, %err, "error while reading source data");
        }
    }
    for (page, content) in overlays {
        let Some(rel) = (*page as usize * page_size).checked_sub(data_offset) else {
            continue;
        };
        if rel + content.len() <= data_size {
            buf[rel..rel + content.len()].copy_from_slice(content);
        }
    }

    // Trim trailing erased pages so the CRC covers only meaningful data.
    let mut data_len = buf.len();
    while data_len > 0 {
        let page_start = data_len.saturating_sub(page_size);
        if is_all(&buf[page_start..data_len], 0xFF) {
            data_len = page_start;
        } else {
            break;
        }
    }

    if av_used_ebs != 0 {
        warn!(vol_id, used_ebs = av_used_ebs, "recovering a LEB of a static volume");
    }

    let crc = UBI_CRC.checksum(&buf[..data_len]);
    let mut vid = Vid {
        vol_type: VolType::Dynamic,
        copy_flag: data_len > 0,
        compat: av_compat,
        vol_id,
        lnum: source_lnum,
        data_size: data_len as u32,
        used_ebs: 0,
        data_pad,
        data_crc: if data_len > 0 { crc } else { 0 },
        sqnum: 0,
    };

    // Write, taking a fresh PEB per attempt; give up into read-only mode
    // when the retries run out.
    let mut tries = 0;
    let new_rec = loop {
        ai.max_sqnum += 1;
        vid.sqnum = ai.max_sqnum;

        let new_rec = ai.early_get_peb(medium, opts.enable_tlc_tracking)?;
        info!(pnum = new_rec.pnum, "using PEB to recover");

        match write_vid_and_data(medium, new_rec.pnum, &vid, &buf[..data_len]) {
            Ok(()) => break new_rec,
            Err(err) => {
                warn!(pnum = new_rec.pnum, %err, "write failed during recovery");
                // The failed PEB is preserved with its genuine erase
                // counter; it may be going bad.
                ai.add_corrupted(new_rec);
                tries += 1;
                if tries > IO_RETRIES {
                    error!("persistent write failure, switching to read-only mode");
                    ai.ro_mode = true;
                    return Ok(());
                }
            }
        }
    };

    // The rebuilt copy replaces the source PEB in the snapshot; the source
    // goes to the head of the erase queue.
    let mut old = old;
    if in_volume {
        let av = ai.find_volume_mut(vol_id).expect("volume exists");
        let slot = av.lebs.get_mut(&source_lnum).expect("slot exists");
        slot.pnum = new_rec.pnum;
        slot.ec = new_rec.ec;
        slot.sqnum = vid.sqnum;
        slot.copy_flag = vid.copy_flag;
        slot.scrub = false;
    } else {
        let mut scratch = Vec::new();
        ai.add_to_av(medium, new_rec.pnum, new_rec.ec, &vid, false, new_rec.tlc, &mut scratch)?;
    }
    old.vol_id = Some(vol_id);
    old.lnum = Some(source_lnum);
    ai.add_to_list(old, true, Queue::Erase);
    Ok(())
}

fn write_vid_and_data<M: Medium>(
    medium: &mut M,
    pnum: u32,
    vid: &Vid,
    data: &[u8],
) -> AttachResult<()> {
    let mut page = vec![0xFF_u8; medium.min_io_size().max(VID_HDR_SIZE)];
    vid.encode(&mut page)?;
    medium.write(&page, pnum, medium.vid_hdr_offset())?;

    if !data.is_empty() {
        // Pad the tail out to the page boundary.
        let mut size = data.len() + medium.min_io_size() - 1;
        size -= size % medium.min_io_size();
        let mut padded = data.to_vec();
        padded.resize(size, 0xFF);
        medium.write(&padded, pnum, medium.data_offset())?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attach::testutil::*;
    use crate::attach::{attach, AttachOptions};
    use crate::medium::FaultKind;

    fn backup_opts() -> AttachOptions {
        AttachOptions {
            enable_low_page_backup: true,
            ..Default::default()
        }
    }

    /// Lay down a backup volume (PEBs 8 and 9) whose LEB 0 log holds one
    /// record describing `source` page 2, with the page content `content`.
    fn put_backup_log(
        medium: &mut crate::medium::SimMedium,
        source: u32,
        sqnum: u64,
        content: &[u8],
    ) {
        for (lnum, pnum) in [(0u32, 8u32), (1, 9)] {
            put_leb(medium, pnum, 1, vid(BACKUP_VOLUME_ID, lnum).sqnum(100 + u64::from(lnum)), &[]);
        }

        // One log entry in page 2 of the LEB 0 PEB.
        let mut page = vec![0xFF_u8; PAGE];
        page[..content.len()].copy_from_slice(content);
        medium.program(8, 2 * PAGE, &page);

        let spare = BackupSpare {
            num: 1,
            pnum: source as u16,
            lnum: 0,
            page: 2,
            vol_id: 5,
            sqnum,
            ..Default::default()
        }
        .seal();
        let mut oob = vec![0u8; BACKUP_SPARE_SIZE];
        oob.copy_from_slice(&spare.to_bytes().unwrap());
        medium.program_oob(8, 2, &oob);
    }

    #[test]
    fn test_spare_record_roundtrip() {
        let spare = BackupSpare {
            num: 2,
            pnum: 17,
            lnum: 3,
            page: 4,
            vol_id: 5,
            sqnum: 99,
            ..Default::default()
        }
        .seal();

        let bytes = spare.to_bytes().unwrap();
        assert_eq!(bytes.len(), BACKUP_SPARE_SIZE);
        assert_eq!(BackupSpare::decode(&bytes), Some(spare));

        let mut broken = bytes.clone();
        broken[0] ^= 1;
        assert_eq!(BackupSpare::decode(&broken), None);
    }

    #[test]
    fn test_first_empty_offset() {
        let mut medium = sim(4);
        // Pages 2 and 3 hold data; 4.. are erased.
        medium.program(0, 2 * PAGE, &[0x11; PAGE]);
        medium.program(0, 3 * PAGE, &[0x22; PAGE]);

        let mut data = vec![0u8; PAGE];
        let mut oob = vec![0u8; 32];
        assert_eq!(first_empty_offset(&medium, 0, &mut data, &mut oob), 4 * PAGE);
        assert_eq!(first_empty_offset(&medium, 1, &mut data, &mut oob), 2 * PAGE);
    }

    #[test]
    fn test_recovery_rebuilds_damaged_source() -> anyhow::Result<()> {
        let mut medium = sim(16);

        // Volume 5, LEB 0 on PEB 3 with data in pages 2 and 3.
        put_leb(&mut medium, 3, 1, vid(5, 0).sqnum(10), &[]);
        medium.program(3, 2 * PAGE, &[0xA1; PAGE]);
        medium.program(3, 3 * PAGE, &[0xA2; PAGE]);

        // The backup log holds the pristine content of page 2.
        put_backup_log(&mut medium, 3, 11, &[0xA1; PAGE]);

        for pnum in [0, 1, 2, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15] {
            put_ec(&mut medium, pnum, 1);
        }

        // The source page is now unreadable: paired-page corruption.
        medium.inject_fault(3, 2 * PAGE, PAGE, FaultKind::EccError);

        let ai = attach(&mut medium, &backup_opts(), None, true)?;

        let av = ai.find_volume(5).unwrap();
        let rec = &av.lebs[&0];
        assert_ne!(rec.pnum, 3, "LEB must have been rebuilt onto a fresh PEB");
        assert!(rec.copy_flag);
        assert_eq!(rec.sqnum, ai.max_sqnum);

        // The old PEB is scheduled for erasure first.
        assert_eq!(ai.erase.front().unwrap().pnum, 3);
        assert!(ai.waiting.is_empty());

        // The rebuilt PEB carries the backed-up content.
        let mut page = vec![0u8; PAGE];
        medium.read(&mut page, rec.pnum, 2 * PAGE)?;
        assert_eq!(page, vec![0xA1; PAGE]);
        medium.read(&mut page, rec.pnum, 3 * PAGE)?;
        assert_eq!(page, vec![0xA2; PAGE]);
        Ok(())
    }

    #[test]
    fn test_recovery_on_empty_high_page_with_newer_record() -> anyhow::Result<()> {
        let mut medium = sim(16);

        // Source PEB 3: only page 2 written; its paired high page (4) is
        // still erased, and the backup record is newer than the snapshot.
        put_leb(&mut medium, 3, 1, vid(5, 0).sqnum(10), &[]);
        medium.program(3, 2 * PAGE, &[0xA1; PAGE]);

        put_backup_log(&mut medium, 3, 11, &[0xA1; PAGE]);
        for pnum in [0, 1, 2, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15] {
            put_ec(&mut medium, pnum, 1);
        }

        let ai = attach(&mut medium, &backup_opts(), None, true)?;
        let rec = &ai.find_volume(5).unwrap().lebs[&0];
        assert_ne!(rec.pnum, 3);
        assert!(rec.copy_flag);
        Ok(())
    }

    #[test]
    fn test_stale_backup_record_is_ignored() -> anyhow::Result<()> {
        let mut medium = sim(16);

        put_leb(&mut medium, 3, 1, vid(5, 0).sqnum(20), &[]);
        medium.program(3, 2 * PAGE, &[0xA1; PAGE]);

        // The snapshot sqnum (20) is newer than the backup record (11):
        // even with the high page empty, nothing needs recovery.
        put_backup_log(&mut medium, 3, 11, &[0xA1; PAGE]);
        for pnum in [0, 1, 2, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15] {
            put_ec(&mut medium, pnum, 1);
        }

        let ai = attach(&mut medium, &backup_opts(), None, true)?;
        let rec = &ai.find_volume(5).unwrap().lebs[&0];
        assert_eq!(rec.pnum, 3);
        assert!(!rec.copy_flag);
        Ok(())
    }

    #[test]
    fn test_corrupt_spare_record_disqualifies_log() -> anyhow::Result<()> {
        let mut medium = sim(16);

        put_leb(&mut medium, 3, 1, vid(5, 0).sqnum(10), &[]);
        medium.program(3, 2 * PAGE, &[0xA1; PAGE]);
        put_backup_log(&mut medium, 3, 11, &[0xA1; PAGE]);
        for pnum in [0, 1, 2, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15] {
            put_ec(&mut medium, pnum, 1);
        }

        // Trash the descriptor CRC.
        let mut oob = vec![0u8; 32];
        medium.read_oob(None, Some(&mut oob[..]), 8, 2 * PAGE)?;
        oob[0] ^= 0xFF;
        medium.program_oob(8, 2, &oob);

        // Damage the source; without a valid record nothing is rebuilt.
        medium.inject_fault(3, 2 * PAGE, PAGE, FaultKind::EccError);

        let ai = attach(&mut medium, &backup_opts(), None, true)?;
        assert_eq!(ai.find_volume(5).unwrap().lebs[&0].pnum, 3);
        Ok(())
    }

    #[test]
    fn test_persistent_write_failure_degrades_to_ro() -> anyhow::Result<()> {
        let mut medium = sim(16);

        put_leb(&mut medium, 3, 1, vid(5, 0).sqnum(10), &[]);
        medium.program(3, 2 * PAGE, &[0xA1; PAGE]);
        put_backup_log(&mut medium, 3, 11, &[0xA1; PAGE]);
        for pnum in [0, 1, 2, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15] {
            put_ec(&mut medium, pnum, 1);
        }
        medium.inject_fault(3, 2 * PAGE, PAGE, FaultKind::EccError);

        // Every candidate PEB refuses the data write. The fault sits in
        // the data area, which the scan itself never touches for clean
        // free PEBs.
        for pnum in [0, 1, 2, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15] {
            medium.inject_fault(pnum, 2 * PAGE, PAGE, FaultKind::Io);
        }

        let ai = attach(&mut medium, &backup_opts(), None, true)?;
        assert!(ai.ro_mode);
        Ok(())
    }
}
