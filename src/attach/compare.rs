//! Deciding which of two physical copies of a logical eraseblock is newer.
//!
//! Two PEBs claiming the same `vol_id:lnum` can exist after a power cut
//! interrupted a copy operation. The copy with the larger sequence number is
//! the candidate winner, but if it carries the copy flag it was mid-write
//! and its data CRC has to be verified before the older copy may be
//! dropped.

use tracing::debug;

use crate::error::{AttachError, Result};
use crate::headers::{read_vid, HdrOutcome, Vid, UBI_CRC};
use crate::medium::Medium;

use super::info::PebRecord;

/// Verdict of [`compare_lebs`].
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct CompareResult {
    /// The second PEB (the one just scanned) is the newer copy.
    pub second_newer: bool,

    /// Bit-flips were seen while verifying the newer copy; it should be
    /// scrubbed.
    pub scrub: bool,

    /// The losing copy failed its data CRC; it should be erased first.
    pub corrupted: bool,
}

/// Compare the LEB copy held by `old` with the copy in PEB `pnum` described
/// by `vid`.
///
/// Equal non-zero sequence numbers are rejected by the caller before this
/// runs; equal zeros come from images predating sequence numbers, where the
/// first copy seen stands.
pub fn compare_lebs<M: Medium + ?Sized>(
    medium: &M,
    old: &PebRecord,
    pnum: u32,
    vid: &Vid,
    buf: &mut Vec<u8>,
) -> Result<CompareResult> {
    if vid.sqnum == old.sqnum {
        return Ok(CompareResult::default());
    }

    let second_newer = vid.sqnum > old.sqnum;

    // If the newer candidate does not carry the copy flag, the decision is
    // final. Otherwise its data CRC decides; for the second PEB we already
    // hold the VID header, for the first one it must be re-read from flash.
    let mut bitflips = false;
    let (check_pnum, check_vid) = if second_newer {
        if !vid.copy_flag {
            debug!(pnum, "second PEB is newer, copy_flag is unset");
            return Ok(CompareResult {
                second_newer: true,
                ..Default::default()
            });
        }
        (pnum, *vid)
    } else {
        if !old.copy_flag {
            debug!(pnum = old.pnum, "first PEB is newer, copy_flag is unset");
            return Ok(CompareResult::default());
        }
        match read_vid(medium, old.pnum, buf)? {
            HdrOutcome::Ok { hdr, bitflips: bf } => {
                bitflips |= bf;
                (old.pnum, hdr)
            }
            outcome => {
                return Err(AttachError::Format(format!(
                    "VID header of PEB {} was OK earlier but reads {outcome:?} now",
                    old.pnum
                )))
            }
        }
    };

    // Read the data of the candidate copy and check the CRC. Bit-flips and
    // ECC errors are tolerated here; the CRC has the final word.
    let len = check_vid.data_size as usize;
    buf.clear();
    buf.resize(len, 0);
    let cond = medium.read(buf, check_pnum, medium.data_offset())?;

    let crc = UBI_CRC.checksum(&buf[..len]);
    if crc != check_vid.data_crc {
        debug!(
            pnum = check_pnum,
            calculated = format_args!("{crc:#010x}"),
            expected = format_args!("{:#010x}", check_vid.data_crc),
            "data CRC mismatch"
        );
        // The candidate is corrupt, so the other copy wins.
        return Ok(CompareResult {
            second_newer: !second_newer,
            scrub: false,
            corrupted: true,
        });
    }

    bitflips |= cond.bitflips();
    debug!(
        pnum = check_pnum,
        second_newer, "data CRC is OK, copy_flag candidate wins"
    );
    Ok(CompareResult {
        second_newer,
        scrub: bitflips,
        corrupted: false,
    })
}
