//! On-flash EC/VID header codecs, with CRC verification/computation and the
//! tagged-outcome decoding the PEB classifier consumes.
//!
//! Each PEB carries an erase-counter (EC) header in its first page and, when
//! the PEB holds a logical eraseblock, a volume-identifier (VID) header in
//! its second page. Both are fixed-size big-endian structures protected by a
//! CRC-32 checksum.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use tracing::warn;

use crate::error::{AttachError, Result};
use crate::medium::{is_all, Medium, ReadCondition};

/// The CRC-32 flavor UBI uses (init 0xFFFFFFFF, no final xor).
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// On-flash format version this implementation understands.
pub const UBI_VERSION: u8 = 1;

/// Erase counters occupy 64 bits on flash but only 31-bit values are legal.
pub const MAX_ERASE_COUNTER: u64 = 0x7FFF_FFFF;

/// Volume IDs below this are user volumes.
pub const MAX_VOLUMES: u32 = 128;

/// First volume ID reserved for internal volumes.
pub const INTERNAL_VOL_START: u32 = 0x7FFF_EFFF;

/// The layout volume, holding the on-flash volume table.
pub const LAYOUT_VOLUME_ID: u32 = INTERNAL_VOL_START;

/// The fastmap super-block volume; its presence anchors a fast attach.
pub const FM_SB_VOLUME_ID: u32 = INTERNAL_VOL_START + 1;

/// The fastmap data volume.
pub const FM_DATA_VOLUME_ID: u32 = INTERNAL_VOL_START + 2;

/// The low-page backup volume (exactly two LEBs).
pub const BACKUP_VOLUME_ID: u32 = INTERNAL_VOL_START + 3;

/// Size of the EC header on flash.
pub const EC_HDR_SIZE: usize = 64;

/// Size of the VID header on flash.
pub const VID_HDR_SIZE: usize = 64;

/// Parsing of UBI headers from byteslices, split into raw deserialization
/// and the magic/CRC checks the decoder sequences itself.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    /// Deserialize without judging validity.
    fn parse_raw(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;
        Some(header)
    }

    /// Deserialize and require magic, version, and CRC to all check out.
    fn parse(buf: &'a [u8]) -> Option<Self> {
        let header = Self::parse_raw(buf)?;

        if (header.get_hdr_magic(), header.get_hdr_version()) != (Self::get_magic(), UBI_VERSION) {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Compute/verify the trailing CRC of a header.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// The meaningful fields of an EC header.
///
/// This is meant to be more ergonomic to work with than [`EcHdr`], which
/// represents the raw data.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Change the erase counter of this EC header.
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Increment the erase counter of this EC header.
    pub fn inc_ec(mut self) -> Self {
        self.ec += 1;
        self
    }

    /// Convert from a byte slice, requiring full validity.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        EcHdr::parse(bytes).map(|x| x.into())
    }

    /// Write into a byte slice.
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        let bytes = EcHdr::from(self)
            .to_bytes()
            .map_err(|e| AttachError::Format(format!("EC header serialization: {e}")))?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| AttachError::Format("EC header buffer too small".into()))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// UBI volume types.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order.
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for
    /// whole-volume updates.
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// How to treat an internal volume this implementation does not know.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Compat {
    /// Delete the volume's PEBs on attach.
    Delete,
    /// Attach, but only in read-only mode.
    Ro,
    /// Keep the volume's PEBs aside, untouched.
    Preserve,
    /// Refuse to attach.
    Reject,
}

impl From<Compat> for u8 {
    fn from(value: Compat) -> Self {
        match value {
            Compat::Delete => 1,
            Compat::Ro => 2,
            Compat::Preserve => 4,
            Compat::Reject => 5,
        }
    }
}

impl TryFrom<u8> for Compat {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            1 => Ok(Self::Delete),
            2 => Ok(Self::Ro),
            4 => Ok(Self::Preserve),
            5 => Ok(Self::Reject),
            _ => Err(()),
        }
    }
}

/// The meaningful fields of a VID header.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another; its data CRC must
    /// be verified before the copy is trusted.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how to handle the volume.
    /// Zero for ordinary user volumes.
    pub compat: u8,

    /// The ID of the volume.
    pub vol_id: u32,

    /// The offset of the LEB within its volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes covered by
    /// `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if it is `Dynamic`.
    pub used_ebs: u32,

    /// Bytes reserved at the end of the PEB to satisfy volume alignment.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A counter greater than that of any previously written VID header,
    /// used to resolve `vol_id:lnum` collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`.
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// The decoded compatibility code, or `None` for ordinary volumes.
    pub fn compat(&self) -> Option<Compat> {
        Compat::try_from(self.compat).ok()
    }

    /// Convert from a byte slice, requiring full validity.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        VidHdr::parse(bytes).and_then(|x| x.try_into().ok())
    }

    /// Write into a byte slice.
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<()> {
        let bytes = VidHdr::from(self)
            .to_bytes()
            .map_err(|e| AttachError::Format(format!("VID header serialization: {e}")))?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| AttachError::Format("VID header buffer too small".into()))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> std::result::Result<Self, ()> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// Outcome of reading one on-flash header.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum HdrOutcome<T> {
    /// Magic and CRC check out. `bitflips` is set when the read reported
    /// corrected bit-flips, in which case the PEB wants scrubbing.
    Ok { hdr: T, bitflips: bool },

    /// The header region is fully erased.
    AllFf { bitflips: bool },

    /// Magic or CRC mismatch. `ecc` is set when the read also reported an
    /// uncorrectable ECC error.
    Bad { ecc: bool },
}

fn classify_invalid<T>(buf: &[u8], cond: ReadCondition) -> HdrOutcome<T> {
    if is_all(buf, 0xFF) {
        HdrOutcome::AllFf {
            bitflips: cond.bitflips(),
        }
    } else {
        HdrOutcome::Bad {
            ecc: cond.ecc_error(),
        }
    }
}

/// Read and decode the EC header of `pnum`.
///
/// Validation on the OK path: magic, CRC, format version (mismatch aborts
/// the attach), erase-counter cap (overflow aborts), and agreement of the
/// stored offsets with the medium geometry (disagreement makes the header
/// untrustworthy, i.e. bad).
pub fn read_ec<M: Medium + ?Sized>(
    medium: &M,
    pnum: u32,
    buf: &mut Vec<u8>,
) -> Result<HdrOutcome<Ec>> {
    buf.clear();
    buf.resize(EC_HDR_SIZE, 0);
    let cond = medium.read(buf, pnum, 0)?;

    let hdr = match EcHdr::parse_raw(buf) {
        Some(hdr) if hdr.get_hdr_magic() == EcHdr::get_magic() && hdr.check_crc() => hdr,
        _ => return Ok(classify_invalid(buf, cond)),
    };

    if hdr.version != UBI_VERSION {
        return Err(AttachError::Format(format!(
            "PEB {pnum}: on-flash format version is {}, supported version is {UBI_VERSION}",
            hdr.version
        )));
    }

    if hdr.ec > MAX_ERASE_COUNTER {
        return Err(AttachError::Format(format!(
            "PEB {pnum}: erase counter overflow, max is {MAX_ERASE_COUNTER}"
        )));
    }

    if hdr.vid_hdr_offset as usize != medium.vid_hdr_offset()
        || hdr.data_offset as usize != medium.data_offset()
    {
        warn!(
            pnum,
            vid_hdr_offset = hdr.vid_hdr_offset,
            data_offset = hdr.data_offset,
            "EC header disagrees with medium geometry"
        );
        return Ok(HdrOutcome::Bad {
            ecc: cond.ecc_error(),
        });
    }

    Ok(HdrOutcome::Ok {
        hdr: hdr.into(),
        bitflips: cond.bitflips(),
    })
}

/// Read and decode the VID header of `pnum`.
pub fn read_vid<M: Medium + ?Sized>(
    medium: &M,
    pnum: u32,
    buf: &mut Vec<u8>,
) -> Result<HdrOutcome<Vid>> {
    buf.clear();
    buf.resize(VID_HDR_SIZE, 0);
    let cond = medium.read(buf, pnum, medium.vid_hdr_offset())?;

    let hdr = match VidHdr::parse_raw(buf) {
        Some(hdr) if hdr.get_hdr_magic() == VidHdr::get_magic() && hdr.check_crc() => hdr,
        _ => return Ok(classify_invalid(buf, cond)),
    };

    if hdr.version != UBI_VERSION {
        return Err(AttachError::Format(format!(
            "PEB {pnum}: on-flash format version is {}, supported version is {UBI_VERSION}",
            hdr.version
        )));
    }

    match Vid::try_from(hdr) {
        // A CRC-valid header describing impossible sizes is still
        // unusable.
        Ok(vid)
            if vid.data_size as usize > medium.leb_size()
                || vid.data_pad as usize > medium.leb_size() =>
        {
            warn!(
                pnum,
                data_size = vid.data_size,
                data_pad = vid.data_pad,
                "VID header disagrees with medium geometry"
            );
            Ok(HdrOutcome::Bad {
                ecc: cond.ecc_error(),
            })
        }
        Ok(vid) => Ok(HdrOutcome::Ok {
            hdr: vid,
            bitflips: cond.bitflips(),
        }),
        // Same verdict for an impossible volume type.
        Err(()) => Ok(HdrOutcome::Bad {
            ecc: cond.ecc_error(),
        }),
    }
}
