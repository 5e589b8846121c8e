//! The full scanner: reads both headers of every PEB, classifies the PEB,
//! and builds up the attach snapshot.

use tracing::{debug, error, info, warn};

use crate::error::{AttachError, Result};
use crate::headers::{
    read_ec, read_vid, Compat, HdrOutcome, BACKUP_VOLUME_ID, EC_HDR_SIZE, FM_DATA_VOLUME_ID,
    FM_SB_VOLUME_ID, LAYOUT_VOLUME_ID, MAX_VOLUMES, VID_HDR_SIZE,
};
use crate::medium::{is_all, Medium};

use super::info::{AttachInfo, PebRecord, Queue};
use super::AttachOptions;

/// Scan PEBs `start..peb_count` and fill in `ai`.
///
/// After the loop the mean erase counters are computed, unknown counters
/// back-filled, and the late viability analysis run.
pub(super) fn scan_all<M: Medium + ?Sized>(
    medium: &M,
    ai: &mut AttachInfo,
    opts: &AttachOptions,
    start: u32,
) -> Result<()> {
    let mut hdr_buf = vec![0u8; EC_HDR_SIZE.max(VID_HDR_SIZE)];
    let mut data_buf: Vec<u8> = Vec::with_capacity(medium.leb_size());

    let count = medium.peb_count();
    let rpt = howudoin::new()
        .label("Scanning PEBs")
        .set_len(u64::from(count.saturating_sub(start)));

    // TLC media are walked in reverse so the TLC region at the top is
    // observed first.
    let pnums: Box<dyn Iterator<Item = u32>> = if opts.enable_tlc_tracking {
        Box::new((start..count).rev())
    } else {
        Box::new(start..count)
    };

    for pnum in pnums {
        scan_peb(medium, ai, opts, pnum, &mut hdr_buf, &mut data_buf)?;
        rpt.inc();
    }

    rpt.close();
    info!("scanning is finished");

    ai.finalize_ec_stats();
    late_analysis(ai)?;

    // PEBs whose erase counter could not be read take the mean value.
    ai.fill_unknown_ec();

    if opts.self_check {
        super::selfcheck::self_check(medium, ai, &mut hdr_buf)?;
    }

    Ok(())
}

/// Scan and process the UBI headers of one PEB.
///
/// Returns the `(vol_id, sqnum)` of the VID header when the PEB holds one,
/// which the fast-attach probe uses to spot the fastmap anchor.
pub(super) fn scan_peb<M: Medium + ?Sized>(
    medium: &M,
    ai: &mut AttachInfo,
    opts: &AttachOptions,
    pnum: u32,
    hdr_buf: &mut Vec<u8>,
    data_buf: &mut Vec<u8>,
) -> Result<Option<(u32, u64)>> {
    debug!(pnum, "scan PEB");

    if medium.is_bad(pnum)? {
        ai.bad_peb_count += 1;
        return Ok(None);
    }

    let tlc = opts.enable_tlc_tracking && medium.is_tlc(pnum);
    let mut bitflips = false;
    let mut ec: Option<u64> = None;
    let mut ec_bad = false;
    let mut ec_ecc = false;

    match read_ec(medium, pnum, hdr_buf)? {
        HdrOutcome::Ok { hdr, bitflips: bf } => {
            bitflips |= bf;

            // All PEBs must carry the same image sequence number, to catch
            // media holding a new image plus leftovers of an old one. Zero
            // stamps are always accepted; old implementations wrote zero.
            if ai.image_seq == 0 {
                ai.image_seq = hdr.image_seq;
            }
            if hdr.image_seq != 0 && ai.image_seq != hdr.image_seq {
                error!(
                    pnum,
                    image_seq = hdr.image_seq,
                    expected = ai.image_seq,
                    "bad image sequence number"
                );
                return Err(AttachError::Format(format!(
                    "bad image sequence number {:#x} in PEB {pnum}, expected {:#x}",
                    hdr.image_seq, ai.image_seq
                )));
            }

            ec = Some(hdr.ec);
        }
        HdrOutcome::AllFf { bitflips: bf } => {
            // The block appears erased.
            ai.empty_peb_count += 1;
            ai.add_to_list(PebRecord::unmapped(pnum, None, tlc), bf, Queue::Erase);
            return Ok(None);
        }
        HdrOutcome::Bad { ecc } => {
            // The VID header may still be fine. Flag bit-flips so the PEB
            // gets moved and its EC header re-created.
            ec_bad = true;
            ec_ecc = ecc;
            bitflips = true;
        }
    }

    let vid = match read_vid(medium, pnum, hdr_buf)? {
        HdrOutcome::Ok { hdr, bitflips: bf } => {
            bitflips |= bf;
            hdr
        }
        HdrOutcome::AllFf { bitflips: bf } => {
            // No VID header: the PEB is free, unless anything about it was
            // shaky, in which case it is erased first.
            let rec = PebRecord::unmapped(pnum, ec, tlc);
            if bf || ec_bad || bitflips {
                ai.add_to_list(rec, true, Queue::Erase);
            } else {
                ai.add_to_list(rec, false, Queue::Free);
            }
            if let Some(e) = ec {
                ai.note_ec(e, tlc);
            }
            return Ok(None);
        }
        HdrOutcome::Bad { ecc } => {
            if ecc && ec_ecc {
                // Both headers unreadable with integrity errors: possibly a
                // bad block that was never marked as such.
                ai.maybe_bad_peb_count += 1;
            }

            let preserve = if ec_bad {
                // Both headers are corrupted. This may be a valid PEB whose
                // headers went bad, but it cannot be told apart from the
                // garbage an interrupted erase leaves behind, so it is
                // scheduled for erasure.
                false
            } else {
                // The EC header was fine but the VID header is not; the
                // data area decides which kind of corruption this is.
                check_corruption(medium, pnum, data_buf)?
            };

            let rec = PebRecord::unmapped(pnum, ec, tlc);
            if preserve {
                ai.add_corrupted(rec);
            } else if opts.enable_low_page_backup {
                // Power-cut corruption is parked until the backup recovery
                // pass has had a chance to look at it.
                ai.add_to_list(rec, true, Queue::Waiting);
            } else {
                ai.add_to_list(rec, true, Queue::Erase);
            }
            if let Some(e) = ec {
                ai.note_ec(e, tlc);
            }
            return Ok(None);
        }
    };

    let seen = Some((vid.vol_id, vid.sqnum));
    let (vol_id, lnum) = (vid.vol_id, vid.lnum);

    if vol_id >= MAX_VOLUMES && vol_id != LAYOUT_VOLUME_ID && vol_id != BACKUP_VOLUME_ID {
        // An internal volume of some other implementation; its
        // compatibility code says how to handle it.
        match vid.compat() {
            Some(Compat::Delete) => {
                if vol_id != FM_SB_VOLUME_ID && vol_id != FM_DATA_VOLUME_ID {
                    info!(
                        vol_id,
                        lnum, "\"delete\" compatible internal volume found, will remove it"
                    );
                }
                let rec = PebRecord {
                    vol_id: Some(vol_id),
                    lnum: Some(lnum),
                    ..PebRecord::unmapped(pnum, ec, tlc)
                };
                ai.add_to_list(rec, true, Queue::Erase);
                return Ok(seen);
            }
            Some(Compat::Ro) => {
                info!(
                    vol_id,
                    lnum, "read-only compatible internal volume found, switching to read-only mode"
                );
                ai.ro_mode = true;
            }
            Some(Compat::Preserve) => {
                info!(vol_id, lnum, "\"preserve\" compatible internal volume found");
                let rec = PebRecord {
                    vol_id: Some(vol_id),
                    lnum: Some(lnum),
                    ..PebRecord::unmapped(pnum, ec, tlc)
                };
                ai.add_to_list(rec, false, Queue::Alien);
                return Ok(seen);
            }
            Some(Compat::Reject) => {
                error!(vol_id, lnum, "incompatible internal volume found");
                return Err(AttachError::Format(format!(
                    "incompatible internal volume {vol_id}:{lnum}"
                )));
            }
            None => {}
        }
    }

    if ec_bad {
        warn!(pnum, "valid VID header but corrupted EC header");
    }

    ai.add_to_av(medium, pnum, ec, &vid, bitflips, tlc, data_buf)?;

    if let Some(e) = ec {
        ai.note_ec(e, tlc);
    }
    Ok(seen)
}

/// Decide whether a PEB with a good EC header but corrupted VID header was
/// hit by a power cut (`false`: safe to erase) or corrupted in some other,
/// unexpected way (`true`: preserve it).
fn check_corruption<M: Medium + ?Sized>(medium: &M, pnum: u32, buf: &mut Vec<u8>) -> Result<bool> {
    let len = medium.leb_size();
    buf.clear();
    buf.resize(len, 0);

    let cond = medium.read(buf, pnum, medium.data_offset())?;
    if cond.bitflips() {
        // Bit-flips or integrity errors while reading the data area:
        // presumably a power cut hit while this PEB was being erased, so it
        // became unstable. Just a guess, but the safe one.
        return Ok(false);
    }

    if is_all(buf, 0xFF) {
        // No data; erasing loses nothing.
        return Ok(false);
    }

    error!(
        pnum,
        "PEB contains corrupted VID header, and the data does not contain all 0xFF"
    );
    error!("this may be a non-UBI PEB or a severe VID header corruption which requires manual inspection");
    Ok(true)
}

/// Look at the overall picture once every PEB has been classified: is this
/// an empty medium to be formatted, or a medium too corrupted to attach?
fn late_analysis(ai: &mut AttachInfo) -> Result<()> {
    let peb_count = ai.peb_count as usize - ai.bad_peb_count - ai.alien_peb_count;
    let max_corr = std::cmp::max(peb_count / 20, 8);

    // A few corrupted PEBs may just be unclean reboots; many of them point
    // at flash or driver trouble.
    if ai.corr_peb_count > 0 {
        let pnums: Vec<u32> = ai.corr.iter().map(|r| r.pnum).collect();
        error!(
            count = ai.corr_peb_count,
            ?pnums,
            "PEBs are corrupted and preserved"
        );
        if ai.corr_peb_count >= max_corr {
            error!("too many corrupted PEBs, refusing");
            return Err(AttachError::CorruptionBudget {
                corrupt: ai.corr_peb_count,
                max: max_corr,
            });
        }
    }

    if ai.empty_peb_count + ai.maybe_bad_peb_count == peb_count {
        // All PEBs are empty, or almost all. A couple of unreadable PEBs
        // are likely bad blocks nobody marked yet and formatting will deal
        // with them; more than that, and this looks like foreign data that
        // must not be destroyed.
        if ai.maybe_bad_peb_count <= 2 {
            ai.is_empty = true;
            info!("empty medium detected");
            ai.image_seq = loop {
                let seq: u32 = rand::random();
                if seq != 0 {
                    break seq;
                }
            };
        } else {
            error!("medium is not UBI-formatted and possibly contains non-UBI data, refusing");
            return Err(AttachError::NotUbi);
        }
    }

    Ok(())
}
