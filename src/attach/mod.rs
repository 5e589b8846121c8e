//! The attaching core.
//!
//! Attaching reads every PEB of a freshly opened medium, decodes the two
//! on-flash headers each PEB carries, classifies the PEB, reconciles
//! multiple physical copies of the same logical eraseblock, and produces
//! the [`AttachInfo`] snapshot that the wear-leveler, the LEB-to-PEB
//! mapper, and the volume-table reader initialize themselves from.
//!
//! Two kinds of corruption are told apart along the way. Power-cut damage
//! is expected: whatever was mid-write when the power went is lost, upper
//! layers are built to cope, and the affected PEBs are quietly scheduled
//! for erasure. Anything else is preserved on a separate queue and loudly
//! reported; too much of it refuses the attach, because formatting over it
//! could destroy data that never belonged to us.
//!
//! When a fastmap anchor is present (and the caller supplies a fastmap
//! reader), the linear scan can be skipped; a missing or stale fastmap
//! falls back to scanning, a corrupt one restarts the attach from scratch.

mod backup;
mod compare;
mod info;
mod scan;
mod selfcheck;
#[cfg(test)]
pub(crate) mod testutil;

pub use backup::{BackupSpare, BACKUP_SPARE_SIZE};
pub use compare::{compare_lebs, CompareResult};
pub use info::{AinfVolume, AttachInfo, EcStats, PebRecord, Queue};

use tracing::{debug, info as log_info};

use crate::error::Result;
use crate::headers::{EC_HDR_SIZE, FM_SB_VOLUME_ID, VID_HDR_SIZE};
use crate::medium::Medium;

/// How many PEBs from the start of the medium are probed for a fastmap
/// anchor before giving up on the fast path.
pub const FM_MAX_START: u32 = 64;

/// How often a failing write is retried during recovery before the device
/// degrades to read-only.
pub const IO_RETRIES: usize = 3;

/// Feature configuration for an attach.
#[derive(Debug, Default, Copy, Clone)]
pub struct AttachOptions {
    /// Probe for a fastmap anchor instead of always scanning linearly.
    pub enable_fastmap: bool,

    /// Track the low-page backup volume and run the paired-page recovery
    /// pass after the scan. Adds the `waiting` queue.
    pub enable_low_page_backup: bool,

    /// Keep separate erase-count statistics for TLC PEBs and scan the
    /// medium in reverse so the TLC region is seen first.
    pub enable_tlc_tracking: bool,

    /// Verify the snapshot invariants after the scan.
    pub self_check: bool,
}

/// What the external fast-attach reader made of the fastmap.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum FastmapOutcome {
    /// The snapshot was populated from the fastmap; no scan needed.
    Attached,
    /// No usable fastmap on the medium; continue scanning after the probed
    /// region.
    NoFastmap,
    /// A fastmap was found but is invalid; the snapshot so far must be
    /// discarded and the whole medium scanned.
    BadFastmap,
}

/// Contract of the external fast-attach reader.
///
/// `anchor` is the PEB holding the newest fastmap super-block; the reader
/// is expected to populate `ai` from the fastmap's payload.
pub trait FastmapReader<M: Medium + ?Sized> {
    fn scan_fastmap(
        &mut self,
        medium: &mut M,
        ai: &mut AttachInfo,
        anchor: u32,
    ) -> Result<FastmapOutcome>;
}

/// Attach a medium: produce the complete snapshot all downstream
/// subsystems consume.
///
/// With `force_scan`, or without a usable fastmap setup, the whole medium
/// is scanned linearly. Errors tear the snapshot down and propagate.
pub fn attach<M: Medium>(
    medium: &mut M,
    opts: &AttachOptions,
    mut fastmap: Option<&mut dyn FastmapReader<M>>,
    force_scan: bool,
) -> Result<AttachInfo> {
    let mut ai = AttachInfo::new(medium.peb_count());

    // Fastmap cannot help on media small enough that the anchor probe
    // would cover everything anyway.
    let fm_usable = opts.enable_fastmap && !force_scan && medium.peb_count() > FM_MAX_START;

    match (fm_usable, fastmap.as_deref_mut()) {
        (true, Some(reader)) => match scan_fast(medium, &mut ai, opts, reader)? {
            FastmapOutcome::Attached => {}
            FastmapOutcome::NoFastmap => {
                scan::scan_all(medium, &mut ai, opts, FM_MAX_START)?;
            }
            FastmapOutcome::BadFastmap => {
                log_info!("discarding invalid fastmap, scanning from scratch");
                ai = AttachInfo::new(medium.peb_count());
                scan::scan_all(medium, &mut ai, opts, 0)?;
            }
        },
        _ => scan::scan_all(medium, &mut ai, opts, 0)?,
    }

    if opts.enable_low_page_backup {
        backup::backup_init_scan(medium, &mut ai, opts)?;
    }

    debug!(
        max_sqnum = ai.max_sqnum,
        mean_ec = ai.ec.mean,
        volumes = ai.volumes.len(),
        "attach complete"
    );
    Ok(ai)
}

/// Probe the first [`FM_MAX_START`] PEBs for the fastmap anchor (the
/// highest-sqnum PEB of the fastmap super-block volume) and hand over to
/// the fast-attach reader when one is found.
fn scan_fast<M: Medium>(
    medium: &mut M,
    ai: &mut AttachInfo,
    opts: &AttachOptions,
    reader: &mut dyn FastmapReader<M>,
) -> Result<FastmapOutcome> {
    let mut hdr_buf = vec![0u8; EC_HDR_SIZE.max(VID_HDR_SIZE)];
    let mut data_buf: Vec<u8> = Vec::new();

    let mut anchor: Option<u32> = None;
    let mut anchor_sqnum = 0u64;

    for pnum in 0..FM_MAX_START.min(medium.peb_count()) {
        let seen = scan::scan_peb(medium, ai, opts, pnum, &mut hdr_buf, &mut data_buf)?;
        if let Some((vol_id, sqnum)) = seen {
            if vol_id == FM_SB_VOLUME_ID && sqnum > anchor_sqnum {
                anchor_sqnum = sqnum;
                anchor = Some(pnum);
            }
        }
    }

    match anchor {
        None => Ok(FastmapOutcome::NoFastmap),
        Some(anchor) => {
            debug!(anchor, "fastmap anchor found");
            reader.scan_fastmap(medium, ai, anchor)
        }
    }
}

#[cfg(test)]
mod test {
    use super::testutil::*;
    use super::*;
    use crate::headers::{Compat, Vid, VolType};
    use crate::medium::SimMedium;

    /// A medium large enough for the fastmap path, with a fastmap anchor
    /// in PEB 0 and a small volume behind the probe window.
    fn fastmap_medium() -> SimMedium {
        let mut medium = sim(80);

        let anchor = Vid {
            compat: Compat::Delete.into(),
            ..vid(FM_SB_VOLUME_ID, 0).sqnum(1000)
        };
        put_leb(&mut medium, 0, 1, anchor, &[0x77; 32]);

        for lnum in 0..4u32 {
            put_leb(&mut medium, 70 + lnum, 1, vid(1, lnum).sqnum(10 + u64::from(lnum)), &[]);
        }
        for pnum in (1..70).chain(74..80) {
            put_ec(&mut medium, pnum, 1);
        }
        medium
    }

    struct StubReader(FastmapOutcome, Option<u32>);

    impl FastmapReader<SimMedium> for StubReader {
        fn scan_fastmap(
            &mut self,
            _medium: &mut SimMedium,
            _ai: &mut AttachInfo,
            anchor: u32,
        ) -> Result<FastmapOutcome> {
            self.1 = Some(anchor);
            Ok(self.0)
        }
    }

    #[test]
    fn test_bad_fastmap_falls_back_to_full_scan() -> anyhow::Result<()> {
        let opts = AttachOptions {
            enable_fastmap: true,
            ..Default::default()
        };

        let mut medium = fastmap_medium();
        let mut reader = StubReader(FastmapOutcome::BadFastmap, None);
        let ai = attach(&mut medium, &opts, Some(&mut reader), false)?;

        // The reader saw the anchor, rejected it, and the fallback scan
        // produced the same snapshot a forced scan would.
        assert_eq!(reader.1, Some(0));
        let mut medium2 = fastmap_medium();
        let forced = attach(&mut medium2, &opts, None, true)?;
        assert_eq!(ai, forced);
        assert_eq!(ai.find_volume(1).unwrap().leb_count(), 4);
        Ok(())
    }

    #[test]
    fn test_no_fastmap_continues_scan_behind_probe_window() -> anyhow::Result<()> {
        let opts = AttachOptions {
            enable_fastmap: true,
            ..Default::default()
        };

        // No anchor anywhere: the probe covers 0..64, the rest is scanned
        // without restarting.
        let mut medium = sim(80);
        for lnum in 0..4u32 {
            put_leb(&mut medium, 70 + lnum, 1, vid(1, lnum).sqnum(10 + u64::from(lnum)), &[]);
        }
        for pnum in (0..70).chain(74..80) {
            put_ec(&mut medium, pnum, 1);
        }

        let mut reader = StubReader(FastmapOutcome::Attached, None);
        let ai = attach(&mut medium, &opts, Some(&mut reader), false)?;

        // The reader never ran; the snapshot still covers every PEB.
        assert_eq!(reader.1, None);
        assert_eq!(ai.find_volume(1).unwrap().leb_count(), 4);
        assert_eq!(ai.free.len(), 76);
        Ok(())
    }

    #[test]
    fn test_fastmap_attached_skips_scan() -> anyhow::Result<()> {
        let opts = AttachOptions {
            enable_fastmap: true,
            ..Default::default()
        };

        let mut medium = fastmap_medium();
        let mut reader = StubReader(FastmapOutcome::Attached, None);
        let ai = attach(&mut medium, &opts, Some(&mut reader), false)?;

        assert_eq!(reader.1, Some(0));
        // Only the probe window was scanned: the volume behind it was
        // never seen (the reader was expected to supply it).
        assert!(ai.find_volume(1).is_none());
        Ok(())
    }

    #[test]
    fn test_small_medium_forces_full_scan() -> anyhow::Result<()> {
        let opts = AttachOptions {
            enable_fastmap: true,
            ..Default::default()
        };

        let mut medium = sim(16);
        for pnum in 0..16 {
            put_ec(&mut medium, pnum, 1);
        }

        let mut reader = StubReader(FastmapOutcome::Attached, None);
        let ai = attach(&mut medium, &opts, Some(&mut reader), false)?;
        assert_eq!(reader.1, None);
        assert_eq!(ai.free.len(), 16);
        Ok(())
    }

    #[test]
    fn test_attach_is_idempotent() -> anyhow::Result<()> {
        let mut medium = sim(16);
        for lnum in 0..4u32 {
            let v = Vid {
                vol_type: VolType::Static,
                used_ebs: 4,
                ..vid(1, lnum).sqnum(10 + u64::from(lnum))
            };
            put_leb(&mut medium, lnum, 2, v, &[0x42; 96]);
        }
        for pnum in 4..16 {
            put_ec(&mut medium, pnum, 2);
        }

        let opts = AttachOptions {
            self_check: true,
            ..Default::default()
        };
        let first = attach(&mut medium, &opts, None, true)?;
        let second = attach(&mut medium, &opts, None, true)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_snapshot_round_trip() -> anyhow::Result<()> {
        let mut medium = sim(16);
        for lnum in 0..5u32 {
            put_leb(&mut medium, 2 * lnum, 3, vid(7, lnum).sqnum(20 + u64::from(lnum)), &[]);
        }
        for pnum in (0..16).filter(|p| p % 2 == 1 || *p > 8) {
            put_ec(&mut medium, pnum, 3);
        }

        let opts = AttachOptions::default();
        let original = attach(&mut medium, &opts, None, true)?;

        // Write the snapshot's volumes back out as a fresh image and
        // re-scan it: the volume records and LEB maps must come back
        // identical.
        let mut rebuilt = sim(16);
        for av in original.volumes.values() {
            for (&lnum, rec) in &av.lebs {
                put_ec(&mut rebuilt, rec.pnum, rec.ec.unwrap());
                let v = Vid {
                    vol_type: av.vol_type,
                    compat: av.compat,
                    used_ebs: av.used_ebs,
                    data_pad: av.data_pad,
                    sqnum: rec.sqnum,
                    ..vid(av.vol_id, lnum)
                };
                put_vid(&mut rebuilt, rec.pnum, v);
            }
        }
        for rec in original.free.iter().chain(original.erase.iter()) {
            if let Some(ec) = rec.ec {
                put_ec(&mut rebuilt, rec.pnum, ec);
            }
        }

        let rescanned = attach(&mut rebuilt, &opts, None, true)?;
        assert_eq!(original.volumes, rescanned.volumes);
        assert_eq!(original.max_sqnum, rescanned.max_sqnum);
        Ok(())
    }
}
