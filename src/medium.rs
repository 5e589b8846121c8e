//! Abstractions over the raw erase-block medium.
//!
//! The attach core never talks to hardware directly; it consumes the
//! [`Medium`] trait, which exposes the medium as a linear array of
//! fixed-size physical eraseblocks (PEBs) with page-granular reads and
//! writes. Reads report whether the controller had to correct bit-flips or
//! gave up with an uncorrectable ECC error; hard faults surface as
//! `std::io::Error`.
//!
//! [`SimMedium`] is an in-memory implementation with fault injection, used
//! by the test suite to construct every corruption scenario the scanner has
//! to discriminate.

use std::io;

use crate::error::Result;

/// Does this region hold only `byte`?
pub fn is_all(buf: &[u8], byte: u8) -> bool {
    buf.iter().all(|&x| x == byte)
}

/// How a read completed.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ReadCondition {
    /// Data returned with no correction applied.
    Clean,

    /// Data returned, but the controller corrected bit-flips along the way.
    /// The block should be scrubbed before the flips accumulate.
    Bitflips,

    /// Uncorrectable ECC error; the buffer holds whatever could be
    /// recovered and must not be trusted.
    EccError,
}

impl ReadCondition {
    pub fn bitflips(self) -> bool {
        self != ReadCondition::Clean
    }

    pub fn ecc_error(self) -> bool {
        self == ReadCondition::EccError
    }
}

/// A medium exposed as a linear array of PEBs.
///
/// Offsets are byte offsets from the start of a PEB and must be
/// page-aligned; buffer lengths must be multiples of the page size, except
/// for the header regions which may be read with their exact size.
pub trait Medium {
    /// Total number of PEBs, including bad ones.
    fn peb_count(&self) -> u32;

    /// Size of one PEB in bytes.
    fn peb_size(&self) -> usize;

    /// Smallest write unit (page size).
    fn min_io_size(&self) -> usize;

    /// Spare (OOB) bytes available per page. Zero on media without an
    /// accessible spare area.
    fn oob_avail(&self) -> usize {
        0
    }

    /// Byte offset of the VID header within a PEB.
    fn vid_hdr_offset(&self) -> usize;

    /// Byte offset of the data area within a PEB.
    fn data_offset(&self) -> usize;

    /// Usable data bytes per PEB.
    fn leb_size(&self) -> usize {
        self.peb_size() - self.data_offset()
    }

    /// Is this PEB marked bad?
    fn is_bad(&self, pnum: u32) -> Result<bool>;

    /// Read `buf.len()` bytes from `pnum` starting at `offset`.
    fn read(&self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<ReadCondition>;

    /// Read one page's data and/or spare area.
    fn read_oob(
        &self,
        data: Option<&mut [u8]>,
        oob: Option<&mut [u8]>,
        pnum: u32,
        offset: usize,
    ) -> Result<ReadCondition>;

    /// Write `buf` to `pnum` starting at `offset`.
    fn write(&mut self, buf: &[u8], pnum: u32, offset: usize) -> Result<()>;

    /// Erase `pnum` and wait for the erase to complete.
    fn sync_erase(&mut self, pnum: u32) -> Result<()>;

    /// The high page paired with `page` on MLC media, or `None` when pages
    /// are not paired (SLC).
    fn paired_page(&self, page: u32) -> Option<u32> {
        let _ = page;
        None
    }

    /// Is this PEB in a TLC region? Only meaningful when the attach is
    /// configured to track TLC statistics separately.
    fn is_tlc(&self, pnum: u32) -> bool {
        let _ = pnum;
        false
    }
}

/// What a [`SimMedium`] fault does to reads covering it.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum FaultKind {
    /// Reads succeed but report corrected bit-flips.
    Bitflips,
    /// Reads report an uncorrectable ECC error.
    EccError,
    /// Reads fail hard.
    Io,
}

#[derive(Debug, Clone)]
struct SimFault {
    offset: usize,
    len: usize,
    kind: FaultKind,
}

#[derive(Debug, Clone)]
struct SimPeb {
    data: Vec<u8>,
    oob: Vec<u8>,
    bad: bool,
    faults: Vec<SimFault>,
}

/// Geometry of a [`SimMedium`].
#[derive(Debug, Copy, Clone)]
pub struct SimGeometry {
    pub peb_count: u32,
    pub pages_per_peb: u32,
    pub page_size: usize,
    pub oob_avail: usize,
}

/// A simulated in-memory medium, for testing purposes.
///
/// PEBs start fully erased (0xFF). The EC header lives in page 0, the VID
/// header in page 1, and data starts at page 2, matching the usual NAND
/// arrangement.
#[derive(Debug, Clone)]
pub struct SimMedium {
    geometry: SimGeometry,
    pebs: Vec<SimPeb>,
}

impl SimMedium {
    pub fn new(geometry: SimGeometry) -> Self {
        let peb = SimPeb {
            data: vec![0xFF; geometry.page_size * geometry.pages_per_peb as usize],
            oob: vec![0xFF; geometry.oob_avail * geometry.pages_per_peb as usize],
            bad: false,
            faults: Vec::new(),
        };
        Self {
            geometry,
            pebs: vec![peb; geometry.peb_count as usize],
        }
    }

    fn peb(&self, pnum: u32) -> Result<&SimPeb> {
        self.pebs
            .get(pnum as usize)
            .ok_or_else(|| out_of_range(pnum).into())
    }

    fn peb_mut(&mut self, pnum: u32) -> Result<&mut SimPeb> {
        self.pebs
            .get_mut(pnum as usize)
            .ok_or_else(|| out_of_range(pnum).into())
    }

    /// Overwrite bytes of a PEB. Test setup only; no program-order rules.
    pub fn program(&mut self, pnum: u32, offset: usize, content: &[u8]) {
        let peb = &mut self.pebs[pnum as usize];
        peb.data[offset..offset + content.len()].copy_from_slice(content);
    }

    /// Overwrite spare-area bytes of one page.
    pub fn program_oob(&mut self, pnum: u32, page: u32, content: &[u8]) {
        let oob_avail = self.geometry.oob_avail;
        let base = page as usize * oob_avail;
        let peb = &mut self.pebs[pnum as usize];
        peb.oob[base..base + content.len()].copy_from_slice(content);
    }

    /// Mark a PEB bad.
    pub fn mark_bad(&mut self, pnum: u32) {
        self.pebs[pnum as usize].bad = true;
    }

    /// Make reads overlapping `offset..offset + len` of `pnum` misbehave.
    pub fn inject_fault(&mut self, pnum: u32, offset: usize, len: usize, kind: FaultKind) {
        self.pebs[pnum as usize]
            .faults
            .push(SimFault { offset, len, kind });
    }

    fn fault_for(&self, pnum: u32, offset: usize, len: usize) -> Option<FaultKind> {
        self.pebs
            .get(pnum as usize)?
            .faults
            .iter()
            .find(|f| offset < f.offset + f.len && f.offset < offset + len)
            .map(|f| f.kind)
    }
}

fn out_of_range(pnum: u32) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("PEB {pnum} out of range"))
}

fn simulated_fault(pnum: u32) -> io::Error {
    io::Error::other(format!("simulated I/O fault at PEB {pnum}"))
}

impl Medium for SimMedium {
    fn peb_count(&self) -> u32 {
        self.geometry.peb_count
    }

    fn peb_size(&self) -> usize {
        self.geometry.page_size * self.geometry.pages_per_peb as usize
    }

    fn min_io_size(&self) -> usize {
        self.geometry.page_size
    }

    fn oob_avail(&self) -> usize {
        self.geometry.oob_avail
    }

    fn vid_hdr_offset(&self) -> usize {
        self.geometry.page_size
    }

    fn data_offset(&self) -> usize {
        self.geometry.page_size * 2
    }

    fn is_bad(&self, pnum: u32) -> Result<bool> {
        Ok(self.peb(pnum)?.bad)
    }

    fn read(&self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<ReadCondition> {
        let fault = self.fault_for(pnum, offset, buf.len());
        if fault == Some(FaultKind::Io) {
            return Err(simulated_fault(pnum).into());
        }

        let peb = self.peb(pnum)?;
        let src = peb
            .data
            .get(offset..offset + buf.len())
            .ok_or_else(|| out_of_range(pnum))?;
        buf.copy_from_slice(src);

        Ok(match fault {
            Some(FaultKind::Bitflips) => ReadCondition::Bitflips,
            Some(FaultKind::EccError) => ReadCondition::EccError,
            _ => ReadCondition::Clean,
        })
    }

    fn read_oob(
        &self,
        data: Option<&mut [u8]>,
        oob: Option<&mut [u8]>,
        pnum: u32,
        offset: usize,
    ) -> Result<ReadCondition> {
        let mut cond = ReadCondition::Clean;
        if let Some(data) = data {
            cond = self.read(data, pnum, offset)?;
        }
        if let Some(oob) = oob {
            let page = offset / self.geometry.page_size;
            let base = page * self.geometry.oob_avail;
            let peb = self.peb(pnum)?;
            oob.copy_from_slice(&peb.oob[base..base + oob.len()]);
        }
        Ok(cond)
    }

    fn write(&mut self, buf: &[u8], pnum: u32, offset: usize) -> Result<()> {
        if self.fault_for(pnum, offset, buf.len()) == Some(FaultKind::Io) {
            return Err(simulated_fault(pnum).into());
        }
        let peb = self.peb_mut(pnum)?;
        let dst = peb
            .data
            .get_mut(offset..offset + buf.len())
            .ok_or_else(|| out_of_range(pnum))?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn sync_erase(&mut self, pnum: u32) -> Result<()> {
        if self.fault_for(pnum, 0, 1) == Some(FaultKind::Io) {
            return Err(simulated_fault(pnum).into());
        }
        let peb = self.peb_mut(pnum)?;
        peb.data.fill(0xFF);
        peb.oob.fill(0xFF);
        peb.faults.clear();
        Ok(())
    }

    fn paired_page(&self, page: u32) -> Option<u32> {
        // A simple two-apart pairing, enough to exercise the backup
        // recovery path.
        let paired = page + 2;
        (paired < self.geometry.pages_per_peb).then_some(paired)
    }
}
