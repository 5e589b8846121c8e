//! Helpers for building flash images in tests.

use crate::headers::{Ec, Vid, EC_HDR_SIZE, UBI_CRC, VID_HDR_SIZE};
use crate::medium::{Medium, SimGeometry, SimMedium};

pub(crate) const PAGE: usize = 128;
pub(crate) const PAGES_PER_PEB: u32 = 8;

/// A small simulated NAND: 8 pages of 128 bytes per PEB, EC header in page
/// 0, VID header in page 1, data from page 2 on.
pub(crate) fn sim(pebs: u32) -> SimMedium {
    SimMedium::new(SimGeometry {
        peb_count: pebs,
        pages_per_peb: PAGES_PER_PEB,
        page_size: PAGE,
        oob_avail: 32,
    })
}

pub(crate) fn vid(vol_id: u32, lnum: u32) -> Vid {
    Vid {
        vol_id,
        lnum,
        ..Default::default()
    }
}

pub(crate) fn put_ec(medium: &mut SimMedium, pnum: u32, ec: u64) {
    put_ec_seq(medium, pnum, ec, 0);
}

pub(crate) fn put_ec_seq(medium: &mut SimMedium, pnum: u32, ec: u64, image_seq: u32) {
    let hdr = Ec {
        ec,
        vid_hdr_offset: medium.vid_hdr_offset() as u32,
        data_offset: medium.data_offset() as u32,
        image_seq,
    };
    let mut buf = vec![0u8; EC_HDR_SIZE];
    hdr.encode(&mut buf).unwrap();
    medium.program(pnum, 0, &buf);
}

pub(crate) fn put_vid(medium: &mut SimMedium, pnum: u32, vid: Vid) {
    let mut buf = vec![0u8; VID_HDR_SIZE];
    vid.encode(&mut buf).unwrap();
    let offset = medium.vid_hdr_offset();
    medium.program(pnum, offset, &buf);
}

pub(crate) fn put_data(medium: &mut SimMedium, pnum: u32, data: &[u8]) {
    let offset = medium.data_offset();
    medium.program(pnum, offset, data);
}

/// Write a complete used PEB. When `data` is non-empty and the caller did
/// not preset a size, the VID header gets a matching `data_size`/`data_crc`
/// pair, the way static-volume writes do.
pub(crate) fn put_leb(medium: &mut SimMedium, pnum: u32, ec: u64, mut vid: Vid, data: &[u8]) -> Vid {
    put_ec(medium, pnum, ec);
    if !data.is_empty() && vid.data_size == 0 {
        vid.data_size = data.len() as u32;
        vid.data_crc = UBI_CRC.checksum(data);
    }
    put_vid(medium, pnum, vid);
    if !data.is_empty() {
        put_data(medium, pnum, data);
    }
    vid
}
