//! Post-scan verification that the attach snapshot is internally
//! consistent and agrees with what is actually on flash.

use tracing::error;

use crate::error::{AttachError, Result};
use crate::headers::{read_vid, HdrOutcome, VolType, INTERNAL_VOL_START, MAX_VOLUMES};
use crate::medium::Medium;

use super::info::AttachInfo;

macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            error!($($arg)+);
            return Err(AttachError::SelfCheck(format!($($arg)+)));
        }
    };
}

/// Verify the snapshot invariants.
///
/// Three passes: structural checks over the volume trees, a re-read of
/// every kept PEB's VID header compared field-by-field against its stored
/// record, and a reference count proving that every non-bad PEB is owned by
/// exactly one container.
pub(super) fn self_check<M: Medium + ?Sized>(
    medium: &M,
    ai: &AttachInfo,
    buf: &mut Vec<u8>,
) -> Result<()> {
    for av in ai.volumes.values() {
        check!(
            !ai.is_empty,
            "is_empty is set although volume {} exists",
            av.vol_id
        );
        check!(
            av.vol_id < MAX_VOLUMES || av.vol_id >= INTERNAL_VOL_START,
            "bad vol_id {}",
            av.vol_id
        );
        check!(
            av.vol_id <= ai.highest_vol_id,
            "highest_vol_id is {}, but vol_id {} is there",
            ai.highest_vol_id,
            av.vol_id
        );
        check!(
            av.data_pad as usize <= medium.leb_size() / 2,
            "bad data_pad {} in volume {}",
            av.data_pad,
            av.vol_id
        );

        for (&lnum, rec) in &av.lebs {
            let stats = if rec.tlc { &ai.tlc_ec } else { &ai.ec };

            check!(
                rec.pnum < ai.peb_count,
                "too high PEB number {}, total PEBs {}",
                rec.pnum,
                ai.peb_count
            );

            let ec = rec.ec.ok_or_else(|| {
                AttachError::SelfCheck(format!(
                    "PEB {} has no erase counter after back-fill",
                    rec.pnum
                ))
            })?;
            check!(
                ec >= stats.min,
                "bad min_ec {}, but EC {} found in PEB {}",
                stats.min,
                ec,
                rec.pnum
            );
            check!(
                ec <= stats.max,
                "bad max_ec {}, but EC {} found in PEB {}",
                stats.max,
                ec,
                rec.pnum
            );

            match av.vol_type {
                VolType::Static => check!(
                    lnum < av.used_ebs,
                    "bad lnum {} or used_ebs {} in volume {}",
                    lnum,
                    av.used_ebs,
                    av.vol_id
                ),
                VolType::Dynamic => check!(
                    av.used_ebs == 0,
                    "non-zero used_ebs {} in dynamic volume {}",
                    av.used_ebs,
                    av.vol_id
                ),
            }

            check!(
                lnum <= av.highest_lnum,
                "incorrect highest_lnum {} or lnum {} in volume {}",
                av.highest_lnum,
                lnum,
                av.vol_id
            );
        }

        if let Some((&last_lnum, _)) = av.lebs.iter().next_back() {
            check!(
                last_lnum == av.highest_lnum,
                "bad highest_lnum {} in volume {}, tree ends at LEB {}",
                av.highest_lnum,
                av.vol_id,
                last_lnum
            );
        }
    }

    // Re-read every kept VID header and make sure the stored record still
    // describes what is on flash.
    for av in ai.volumes.values() {
        for (&lnum, rec) in &av.lebs {
            let vid = match read_vid(medium, rec.pnum, buf)? {
                HdrOutcome::Ok { hdr, .. } => hdr,
                outcome => {
                    error!(pnum = rec.pnum, ?outcome, "VID header is not OK");
                    return Err(AttachError::SelfCheck(format!(
                        "VID header of PEB {} is not OK: {outcome:?}",
                        rec.pnum
                    )));
                }
            };

            check!(av.vol_type == vid.vol_type, "bad vol_type in PEB {}", rec.pnum);
            check!(rec.sqnum == vid.sqnum, "bad sqnum {} in PEB {}", rec.sqnum, rec.pnum);
            check!(av.vol_id == vid.vol_id, "bad vol_id {} in PEB {}", av.vol_id, rec.pnum);
            check!(av.compat == vid.compat, "bad compat {} in PEB {}", vid.compat, rec.pnum);
            check!(lnum == vid.lnum, "bad lnum {} in PEB {}", lnum, rec.pnum);
            check!(
                av.used_ebs == vid.used_ebs,
                "bad used_ebs {} in PEB {}",
                av.used_ebs,
                rec.pnum
            );
            check!(
                av.data_pad == vid.data_pad,
                "bad data_pad {} in PEB {}",
                av.data_pad,
                rec.pnum
            );
            if lnum == av.highest_lnum {
                check!(
                    av.last_data_size == vid.data_size,
                    "bad last_data_size {} in volume {}",
                    av.last_data_size,
                    av.vol_id
                );
            }
        }
    }

    // Every non-bad PEB must be referenced exactly once across the trees
    // and queues.
    let mut refs = vec![0u32; ai.peb_count as usize];
    for pnum in 0..ai.peb_count {
        if medium.is_bad(pnum)? {
            refs[pnum as usize] += 1;
        }
    }
    for av in ai.volumes.values() {
        for rec in av.lebs.values() {
            refs[rec.pnum as usize] += 1;
        }
    }
    for list in [&ai.free, &ai.erase, &ai.corr, &ai.alien, &ai.waiting] {
        for rec in list {
            refs[rec.pnum as usize] += 1;
        }
    }
    for (pnum, &n) in refs.iter().enumerate() {
        check!(n != 0, "PEB {} is not referred", pnum);
        check!(n == 1, "PEB {} is referred {} times", pnum, n);
    }

    Ok(())
}
