//! The attach snapshot: per-volume LEB maps, the PEB queues, and the
//! aggregate bookkeeping that downstream subsystems initialize from.
//!
//! Every non-bad PEB ends up owned by exactly one container: a volume's LEB
//! map or one of the `free`/`erase`/`corr`/`alien`/`waiting` queues. Records
//! move between containers by value, so the ownership invariant is enforced
//! by construction.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, error};

use crate::error::{AttachError, Result};
use crate::headers::{Ec, Vid, VolType, EC_HDR_SIZE, MAX_ERASE_COUNTER};
use crate::medium::Medium;

use super::compare::compare_lebs;

/// One physical eraseblock as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PebRecord {
    pub pnum: u32,
    /// Erase counter; `None` until known (back-filled with the mean after
    /// the scan).
    pub ec: Option<u64>,
    /// Last volume this PEB was seen to belong to, if any.
    pub vol_id: Option<u32>,
    /// Last LEB number this PEB was seen to hold, if any.
    pub lnum: Option<u32>,
    pub sqnum: u64,
    pub copy_flag: bool,
    /// Bit-flips were seen; the PEB should be scrubbed.
    pub scrub: bool,
    /// The PEB lies in a TLC region (only set when TLC tracking is on).
    pub tlc: bool,
}

impl PebRecord {
    /// A record for a PEB with no (readable) VID association.
    pub fn unmapped(pnum: u32, ec: Option<u64>, tlc: bool) -> Self {
        Self {
            pnum,
            ec,
            vol_id: None,
            lnum: None,
            sqnum: 0,
            copy_flag: false,
            scrub: false,
            tlc,
        }
    }
}

/// Scan-time information about one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AinfVolume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub compat: u8,
    pub data_pad: u32,
    /// LEB count of static volumes; 0 for dynamic ones.
    pub used_ebs: u32,
    pub highest_lnum: u32,
    /// `data_size` from the VID header of the highest LEB.
    pub last_data_size: u32,
    /// LEB number to the PEB currently holding that LEB.
    pub lebs: BTreeMap<u32, PebRecord>,
}

impl AinfVolume {
    pub fn leb_count(&self) -> usize {
        self.lebs.len()
    }
}

/// Running erase-counter statistics for one PEB class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcStats {
    pub sum: u64,
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: u64,
}

impl Default for EcStats {
    fn default() -> Self {
        Self {
            sum: 0,
            count: 0,
            min: u64::MAX,
            max: 0,
            mean: 0,
        }
    }
}

/// Which queue [`AttachInfo::add_to_list`] targets.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Queue {
    Free,
    Erase,
    Alien,
    /// PEBs with power-cut VID corruption, parked until the low-page backup
    /// recovery pass has run. Only used when that feature is enabled.
    Waiting,
}

/// Everything the scan learned about the medium.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachInfo {
    /// Total PEBs on the medium, including bad ones.
    pub peb_count: u32,

    /// Volume ID to scan-time volume information, ordered by ID.
    pub volumes: BTreeMap<u32, AinfVolume>,

    pub free: VecDeque<PebRecord>,
    pub erase: VecDeque<PebRecord>,
    pub corr: VecDeque<PebRecord>,
    pub alien: VecDeque<PebRecord>,
    pub waiting: VecDeque<PebRecord>,

    pub bad_peb_count: usize,
    pub alien_peb_count: usize,
    pub corr_peb_count: usize,
    pub empty_peb_count: usize,
    /// PEBs where both headers were unreadable with ECC errors; possibly
    /// bad blocks that were never marked.
    pub maybe_bad_peb_count: usize,

    pub ec: EcStats,
    /// Separate statistics for TLC PEBs, when TLC tracking is enabled.
    pub tlc_ec: EcStats,

    pub highest_vol_id: u32,
    pub max_sqnum: u64,
    /// Image sequence number shared by all EC headers (zero tolerated).
    pub image_seq: u32,
    pub is_empty: bool,
    /// Set when a read-only compatible internal volume was found, or when
    /// recovery gave up writing; the device must attach read-only.
    pub ro_mode: bool,
}

impl AttachInfo {
    pub fn new(peb_count: u32) -> Self {
        Self {
            peb_count,
            volumes: BTreeMap::new(),
            free: VecDeque::new(),
            erase: VecDeque::new(),
            corr: VecDeque::new(),
            alien: VecDeque::new(),
            waiting: VecDeque::new(),
            bad_peb_count: 0,
            alien_peb_count: 0,
            corr_peb_count: 0,
            empty_peb_count: 0,
            maybe_bad_peb_count: 0,
            ec: EcStats::default(),
            tlc_ec: EcStats::default(),
            highest_vol_id: 0,
            max_sqnum: 0,
            image_seq: 0,
            is_empty: false,
            ro_mode: false,
        }
    }

    /// Number of PEBs not marked bad.
    pub fn good_peb_count(&self) -> usize {
        self.peb_count as usize - self.bad_peb_count
    }

    pub fn mean_ec(&self) -> u64 {
        self.ec.mean
    }

    pub fn max_ec(&self) -> u64 {
        self.ec.max
    }

    /// Total wear estimate: the known erase-counter sum plus the mean for
    /// every good PEB whose counter could not be read.
    pub fn ec_sum_estimate(&self) -> u64 {
        let known = self.ec.count + self.tlc_ec.count;
        let unknown = (self.good_peb_count() as u64).saturating_sub(known);
        self.ec.sum + self.tlc_ec.sum + self.ec.mean * unknown
    }

    /// Mean erase counter for the class `tlc` belongs to.
    pub fn mean_for(&self, tlc: bool) -> u64 {
        if tlc {
            self.tlc_ec.mean
        } else {
            self.ec.mean
        }
    }

    /// Record a known erase counter in the running statistics.
    pub(super) fn note_ec(&mut self, ec: u64, tlc: bool) {
        let stats = if tlc { &mut self.tlc_ec } else { &mut self.ec };
        stats.sum += ec;
        stats.count += 1;
        if ec > stats.max {
            stats.max = ec;
        }
        if ec < stats.min {
            stats.min = ec;
        }
    }

    pub(super) fn finalize_ec_stats(&mut self) {
        for stats in [&mut self.ec, &mut self.tlc_ec] {
            if stats.count > 0 {
                stats.mean = stats.sum / stats.count;
            } else {
                stats.min = 0;
            }
        }
    }

    /// Replace unknown erase counters everywhere with the class mean.
    pub(super) fn fill_unknown_ec(&mut self) {
        let (mean, tlc_mean) = (self.ec.mean, self.tlc_ec.mean);
        let fill = |rec: &mut PebRecord| {
            if rec.ec.is_none() {
                rec.ec = Some(if rec.tlc { tlc_mean } else { mean });
            }
        };

        for av in self.volumes.values_mut() {
            av.lebs.values_mut().for_each(fill);
        }
        for list in [
            &mut self.free,
            &mut self.erase,
            &mut self.corr,
            &mut self.alien,
            &mut self.waiting,
        ] {
            list.iter_mut().for_each(fill);
        }
    }

    /// Find the volume for `vol_id`, creating it from `vid` if absent.
    pub fn add_volume(&mut self, vid: &Vid) -> &mut AinfVolume {
        let vol_id = vid.vol_id;
        if vol_id > self.highest_vol_id {
            self.highest_vol_id = vol_id;
        }
        self.volumes.entry(vol_id).or_insert_with(|| {
            debug!(vol_id, "added volume");
            AinfVolume {
                vol_id,
                vol_type: vid.vol_type,
                compat: vid.compat,
                data_pad: vid.data_pad,
                used_ebs: vid.used_ebs,
                highest_lnum: 0,
                last_data_size: 0,
                lebs: BTreeMap::new(),
            }
        })
    }

    pub fn find_volume(&self, vol_id: u32) -> Option<&AinfVolume> {
        self.volumes.get(&vol_id)
    }

    pub fn find_volume_mut(&mut self, vol_id: u32) -> Option<&mut AinfVolume> {
        self.volumes.get_mut(&vol_id)
    }

    /// Drop a volume; its PEBs are rescheduled for erasure.
    pub fn remove_volume(&mut self, vol_id: u32) {
        let Some(av) = self.volumes.remove(&vol_id) else {
            return;
        };
        debug!(vol_id, "remove attaching information about volume");
        for (_, rec) in av.lebs {
            self.erase.push_back(rec);
        }
    }

    /// Push a record onto one of the queues. `to_head` means the PEB will
    /// be processed first later; corrupted PEBs go to the head of the erase
    /// queue so they are disposed of as soon as possible.
    pub fn add_to_list(&mut self, rec: PebRecord, to_head: bool, queue: Queue) {
        debug!(pnum = rec.pnum, ec = ?rec.ec, ?queue, to_head, "add to list");
        if queue == Queue::Alien {
            self.alien_peb_count += 1;
        }
        let list = match queue {
            Queue::Free => &mut self.free,
            Queue::Erase => &mut self.erase,
            Queue::Alien => &mut self.alien,
            Queue::Waiting => &mut self.waiting,
        };
        if to_head {
            list.push_front(rec);
        } else {
            list.push_back(rec);
        }
    }

    /// Record a PEB whose corruption was presumably not caused by a power
    /// cut; such PEBs are preserved for inspection.
    pub fn add_corrupted(&mut self, rec: PebRecord) {
        debug!(pnum = rec.pnum, ec = ?rec.ec, "add to corrupted");
        self.corr_peb_count += 1;
        self.corr.push_front(rec);
    }

    /// Insert a used PEB into its volume's LEB map.
    ///
    /// When the target LEB slot is already occupied the two copies are
    /// reconciled: the loser is rescheduled for erasure (head of the queue
    /// when its data turned out corrupt) and the winner keeps the slot.
    pub fn add_to_av<M: Medium + ?Sized>(
        &mut self,
        medium: &M,
        pnum: u32,
        ec: Option<u64>,
        vid: &Vid,
        bitflips: bool,
        tlc: bool,
        buf: &mut Vec<u8>,
    ) -> Result<()> {
        let (vol_id, lnum, sqnum) = (vid.vol_id, vid.lnum, vid.sqnum);
        debug!(pnum, vol_id, lnum, ec = ?ec, sqnum, bitflips, "add used PEB");

        self.add_volume(vid);
        if self.max_sqnum < sqnum {
            self.max_sqnum = sqnum;
        }

        let new_rec = PebRecord {
            pnum,
            ec,
            vol_id: Some(vol_id),
            lnum: Some(lnum),
            sqnum,
            copy_flag: vid.copy_flag,
            scrub: bitflips,
            tlc,
        };

        let av = self.volumes.get(&vol_id).expect("volume just added");
        let Some(old) = av.lebs.get(&lnum).cloned() else {
            // First instance of this logical eraseblock.
            validate_vid_hdr(vid, av, pnum)?;
            let av = self.volumes.get_mut(&vol_id).expect("volume just added");
            if av.highest_lnum <= lnum {
                av.highest_lnum = lnum;
                av.last_data_size = vid.data_size;
            }
            av.lebs.insert(lnum, new_rec);
            return Ok(());
        };

        debug!(
            pnum = old.pnum,
            sqnum = old.sqnum,
            ec = ?old.ec,
            "this LEB already exists"
        );

        // Two copies sharing a non-zero sequence number mean the image is
        // bad. A zero pair is an ancient image from before sequence
        // numbers; those still attach as long as they are clean.
        if old.sqnum == sqnum && sqnum != 0 {
            return Err(AttachError::Format(format!(
                "two LEBs with same sequence number {sqnum}: PEBs {} and {pnum}, volume {vol_id} LEB {lnum}",
                old.pnum
            )));
        }

        let cmp = compare_lebs(medium, &old, pnum, vid, buf)?;
        if cmp.second_newer {
            validate_vid_hdr(vid, av, pnum)?;

            let mut winner = new_rec;
            winner.scrub = cmp.scrub || bitflips;

            let av = self.volumes.get_mut(&vol_id).expect("volume just added");
            let slot = av.lebs.get_mut(&lnum).expect("slot occupied");
            let loser = std::mem::replace(slot, winner);
            if av.highest_lnum == lnum {
                av.last_data_size = vid.data_size;
            }
            self.add_to_list(loser, cmp.corrupted, Queue::Erase);
        } else {
            // The copy just scanned is the older one.
            self.add_to_list(new_rec, cmp.corrupted, Queue::Erase);
        }
        Ok(())
    }

    /// Hand out a free PEB during attach, before the wear-leveler exists.
    ///
    /// Prefers the head of the `free` queue; failing that, erases
    /// candidates from the `erase` queue until one sticks.
    pub fn early_get_peb<M: Medium + ?Sized>(
        &mut self,
        medium: &mut M,
        tlc_tracking: bool,
    ) -> Result<PebRecord> {
        if let Some(pos) = self.free.iter().position(|r| !(tlc_tracking && r.tlc)) {
            let rec = self.free.remove(pos).expect("position valid");
            debug!(pnum = rec.pnum, ec = ?rec.ec, "return free PEB");
            return Ok(rec);
        }

        // Try to erase candidates from the erase queue and pick the first
        // that succeeds. Bad eraseblocks are not handled here; they will be
        // dealt with later.
        let mut i = 0;
        while i < self.erase.len() {
            if tlc_tracking && self.erase[i].tlc {
                i += 1;
                continue;
            }
            let ec = self.erase[i].ec.unwrap_or(self.mean_for(self.erase[i].tlc));
            match early_erase_peb(medium, self.erase[i].pnum, ec + 1, self.image_seq) {
                Ok(()) => {
                    let mut rec = self.erase.remove(i).expect("index valid");
                    rec.ec = Some(ec + 1);
                    debug!(pnum = rec.pnum, ec = ec + 1, "return erased PEB");
                    return Ok(rec);
                }
                Err(err) => {
                    debug!(pnum = self.erase[i].pnum, %err, "early erase failed");
                    i += 1;
                }
            }
        }

        error!("no free eraseblocks");
        Err(AttachError::NoSpace)
    }
}

/// Check that a VID header is consistent with what previous LEBs of the
/// same volume established.
fn validate_vid_hdr(vid: &Vid, av: &AinfVolume, pnum: u32) -> Result<()> {
    if av.lebs.is_empty() {
        return Ok(());
    }

    let field = if vid.vol_id != av.vol_id {
        "vol_id"
    } else if vid.vol_type != av.vol_type {
        "vol_type"
    } else if vid.used_ebs != av.used_ebs {
        "used_ebs"
    } else if vid.data_pad != av.data_pad {
        "data_pad"
    } else {
        return Ok(());
    };

    error!(pnum, vol_id = av.vol_id, field, "inconsistent VID header");
    Err(AttachError::Format(format!(
        "inconsistent {field} in VID header at PEB {pnum}"
    )))
}

/// Erase `pnum` and write a fresh EC header carrying `ec`.
fn early_erase_peb<M: Medium + ?Sized>(
    medium: &mut M,
    pnum: u32,
    ec: u64,
    image_seq: u32,
) -> Result<()> {
    if ec >= MAX_ERASE_COUNTER {
        // 64-bit counters are stored, but only 31-bit values are used.
        return Err(AttachError::Format(format!(
            "erase counter overflow at PEB {pnum}, EC {ec}"
        )));
    }

    medium.sync_erase(pnum)?;

    let hdr = Ec {
        ec,
        vid_hdr_offset: medium.vid_hdr_offset() as u32,
        data_offset: medium.data_offset() as u32,
        image_seq,
    };
    let mut page = vec![0xFF; medium.min_io_size().max(EC_HDR_SIZE)];
    hdr.encode(&mut page)?;
    medium.write(&page, pnum, 0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attach::testutil::*;
    use crate::error::AttachError;
    use crate::headers::{read_ec, HdrOutcome, UBI_CRC};
    use crate::medium::FaultKind;

    #[test]
    fn test_add_to_av_first_insert() -> anyhow::Result<()> {
        let medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        let vid = vid(1, 0).sqnum(10);
        ai.add_to_av(&medium, 3, Some(2), &vid, false, false, &mut buf)?;

        let av = ai.find_volume(1).unwrap();
        assert_eq!(av.leb_count(), 1);
        assert_eq!(av.lebs[&0].pnum, 3);
        assert_eq!(av.highest_lnum, 0);
        assert_eq!(ai.max_sqnum, 10);
        Ok(())
    }

    #[test]
    fn test_duplicate_sqnum_rejected() -> anyhow::Result<()> {
        let medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        let v = vid(1, 0).sqnum(42);
        ai.add_to_av(&medium, 0, Some(1), &v, false, false, &mut buf)?;
        let err = ai
            .add_to_av(&medium, 1, Some(1), &v, false, false, &mut buf)
            .unwrap_err();
        assert!(matches!(err, AttachError::Format(_)));
        Ok(())
    }

    #[test]
    fn test_duplicate_zero_sqnum_tolerated() -> anyhow::Result<()> {
        let medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        let v = vid(1, 0).sqnum(0);
        ai.add_to_av(&medium, 0, Some(1), &v, false, false, &mut buf)?;
        ai.add_to_av(&medium, 1, Some(1), &v, false, false, &mut buf)?;

        // The first copy seen stands; the second is rescheduled for
        // erasure.
        assert_eq!(ai.find_volume(1).unwrap().lebs[&0].pnum, 0);
        assert_eq!(ai.erase.len(), 1);
        assert_eq!(ai.erase[0].pnum, 1);
        Ok(())
    }

    #[test]
    fn test_newer_copy_wins() -> anyhow::Result<()> {
        let mut medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        // PEB 0: vol 1, LEB 2, sqnum 50, no copy flag.
        let old = vid(1, 2).sqnum(50);
        ai.add_to_av(&medium, 0, Some(1), &old, false, false, &mut buf)?;

        // PEB 1: same LEB, sqnum 51, copy flag set, valid data CRC.
        let data = vec![0x5A; 64];
        let new = Vid {
            copy_flag: true,
            data_size: data.len() as u32,
            data_crc: UBI_CRC.checksum(&data),
            ..vid(1, 2).sqnum(51)
        };
        medium.program(1, medium.data_offset(), &data);
        ai.add_to_av(&medium, 1, Some(1), &new, false, false, &mut buf)?;

        let av = ai.find_volume(1).unwrap();
        assert_eq!(av.lebs[&2].pnum, 1);
        assert_eq!(av.lebs[&2].sqnum, 51);
        // The loser went to the erase queue tail.
        assert_eq!(ai.erase.back().unwrap().pnum, 0);
        assert_eq!(ai.max_sqnum, 51);
        Ok(())
    }

    #[test]
    fn test_corrupt_copy_loses() -> anyhow::Result<()> {
        let mut medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        let old = vid(1, 2).sqnum(50);
        ai.add_to_av(&medium, 0, Some(1), &old, false, false, &mut buf)?;

        // The higher-sqnum copy carries the copy flag but its data does
        // not match the recorded CRC, so the decision inverts.
        let data = vec![0x5A; 64];
        let new = Vid {
            copy_flag: true,
            data_size: data.len() as u32,
            data_crc: UBI_CRC.checksum(&data) ^ 1,
            ..vid(1, 2).sqnum(51)
        };
        medium.program(1, medium.data_offset(), &data);
        ai.add_to_av(&medium, 1, Some(1), &new, false, false, &mut buf)?;

        let av = ai.find_volume(1).unwrap();
        assert_eq!(av.lebs[&2].pnum, 0);
        assert_eq!(av.lebs[&2].sqnum, 50);
        // The corrupt copy went to the erase queue head.
        assert_eq!(ai.erase.front().unwrap().pnum, 1);
        Ok(())
    }

    #[test]
    fn test_validate_vid_hdr_mismatch() -> anyhow::Result<()> {
        let medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        let v0 = Vid {
            used_ebs: 0,
            ..vid(1, 0).sqnum(1)
        };
        ai.add_to_av(&medium, 0, Some(1), &v0, false, false, &mut buf)?;

        let v1 = Vid {
            used_ebs: 4,
            ..vid(1, 1).sqnum(2)
        };
        let err = ai
            .add_to_av(&medium, 1, Some(1), &v1, false, false, &mut buf)
            .unwrap_err();
        assert!(matches!(err, AttachError::Format(_)));
        Ok(())
    }

    #[test]
    fn test_remove_volume() -> anyhow::Result<()> {
        let medium = sim(8);
        let mut ai = AttachInfo::new(8);
        let mut buf = Vec::new();

        ai.add_to_av(&medium, 0, Some(1), &vid(1, 0).sqnum(1), false, false, &mut buf)?;
        ai.add_to_av(&medium, 1, Some(1), &vid(1, 1).sqnum(2), false, false, &mut buf)?;

        ai.remove_volume(1);
        assert!(ai.find_volume(1).is_none());
        assert_eq!(ai.erase.len(), 2);
        Ok(())
    }

    #[test]
    fn test_early_get_peb_prefers_free() -> anyhow::Result<()> {
        let mut medium = sim(8);
        let mut ai = AttachInfo::new(8);

        ai.add_to_list(PebRecord::unmapped(5, Some(7), false), false, Queue::Free);
        ai.add_to_list(PebRecord::unmapped(6, Some(9), false), false, Queue::Erase);

        let rec = ai.early_get_peb(&mut medium, false)?;
        assert_eq!(rec.pnum, 5);
        assert_eq!(rec.ec, Some(7));
        assert!(ai.free.is_empty());
        assert_eq!(ai.erase.len(), 1);
        Ok(())
    }

    #[test]
    fn test_early_get_peb_erases() -> anyhow::Result<()> {
        let mut medium = sim(8);
        let mut ai = AttachInfo::new(8);
        ai.image_seq = 0xCAFE;
        ai.ec.mean = 12;

        // Unknown erase counter: the mean is substituted before erasing.
        ai.add_to_list(PebRecord::unmapped(2, None, false), false, Queue::Erase);

        let rec = ai.early_get_peb(&mut medium, false)?;
        assert_eq!(rec.pnum, 2);
        assert_eq!(rec.ec, Some(13));
        assert!(ai.erase.is_empty());

        // A fresh EC header was written out.
        let mut buf = vec![0u8; EC_HDR_SIZE];
        match read_ec(&medium, 2, &mut buf)? {
            HdrOutcome::Ok { hdr, .. } => {
                assert_eq!(hdr.ec, 13);
                assert_eq!(hdr.image_seq, 0xCAFE);
            }
            other => panic!("expected EC header, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_early_get_peb_skips_failing_candidates() -> anyhow::Result<()> {
        let mut medium = sim(8);
        let mut ai = AttachInfo::new(8);

        medium.inject_fault(3, 0, 1024, FaultKind::Io);
        ai.add_to_list(PebRecord::unmapped(3, Some(1), false), false, Queue::Erase);
        ai.add_to_list(PebRecord::unmapped(4, Some(2), false), false, Queue::Erase);

        let rec = ai.early_get_peb(&mut medium, false)?;
        assert_eq!(rec.pnum, 4);
        // The failing candidate stays on the queue.
        assert_eq!(ai.erase.len(), 1);
        assert_eq!(ai.erase[0].pnum, 3);
        Ok(())
    }

    #[test]
    fn test_ec_sum_estimate_covers_unknown_pebs() {
        let mut ai = AttachInfo::new(10);
        ai.bad_peb_count = 1;
        for ec in [4, 6] {
            ai.note_ec(ec, false);
        }
        ai.finalize_ec_stats();

        // 9 good PEBs, 2 with known counters summing to 10, mean 5: the
        // remaining 7 are assumed mean wear.
        assert_eq!(ai.good_peb_count(), 9);
        assert_eq!(ai.mean_ec(), 5);
        assert_eq!(ai.ec_sum_estimate(), 10 + 5 * 7);
    }

    #[test]
    fn test_early_get_peb_no_space() {
        let mut medium = sim(8);
        let mut ai = AttachInfo::new(8);
        assert!(matches!(
            ai.early_get_peb(&mut medium, false),
            Err(AttachError::NoSpace)
        ));
    }
}
