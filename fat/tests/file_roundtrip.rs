// Copyright 2026 The cardfat Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod common;

use cardfat::{FileMode, SeekWhence};
use common::{drive, fat16_device, mount, Fs};

#[test]
fn write_then_reopen_reads_back_identical_bytes() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let payload: Vec<u8> = (0..3_000u32).map(|i| (i % 251) as u8).collect();

    let id = drive(&mut fs, |fs| fs.fopen("DATA.BIN", FileMode::CREATE | FileMode::WRITE));
    let written = drive(&mut fs, |fs| fs.fwrite(id, &payload));
    assert_eq!(written, payload.len());
    drive(&mut fs, |fs| fs.fclose(id));

    let id = drive(&mut fs, |fs| fs.fopen("DATA.BIN", FileMode::READ));
    let mut readback = vec![0u8; payload.len()];
    let mut total = 0;
    while total < readback.len() {
        let n = drive(&mut fs, |fs| fs.fread(id, &mut readback[total..]));
        assert!(n > 0, "fread made no progress before EOF");
        total += n;
    }
    assert_eq!(readback, payload);
    drive(&mut fs, |fs| fs.fclose(id));
}

#[test]
fn append_mode_extends_past_existing_contents() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let id = drive(&mut fs, |fs| fs.fopen("LOG.TXT", FileMode::CREATE | FileMode::WRITE));
    drive(&mut fs, |fs| fs.fwrite(id, b"first "));
    drive(&mut fs, |fs| fs.fclose(id));

    let id = drive(&mut fs, |fs| fs.fopen("LOG.TXT", FileMode::WRITE | FileMode::APPEND));
    drive(&mut fs, |fs| fs.fwrite(id, b"second"));
    drive(&mut fs, |fs| fs.fclose(id));

    let id = drive(&mut fs, |fs| fs.fopen("LOG.TXT", FileMode::READ));
    let mut buf = [0u8; 32];
    let n = drive(&mut fs, |fs| fs.fread(id, &mut buf));
    assert_eq!(&buf[..n], b"first second");
    drive(&mut fs, |fs| fs.fclose(id));
}

#[test]
fn seek_set_then_read_lands_on_requested_offset() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let id = drive(&mut fs, |fs| fs.fopen("SEEK.BIN", FileMode::CREATE | FileMode::WRITE));
    drive(&mut fs, |fs| fs.fwrite(id, b"0123456789"));
    drive(&mut fs, |fs| fs.fclose(id));

    let id = drive(&mut fs, |fs| fs.fopen("SEEK.BIN", FileMode::READ));
    drive(&mut fs, |fs| fs.fseek(id, 5, SeekWhence::Set));
    assert_eq!(fs.ftell(id), 5);
    let mut buf = [0u8; 5];
    let n = drive(&mut fs, |fs| fs.fread(id, &mut buf));
    assert_eq!(&buf[..n], b"56789");
    assert!(fs.feof(id));
    drive(&mut fs, |fs| fs.fclose(id));
}

#[test]
fn funlink_marks_entry_deleted_so_fopen_no_longer_finds_it() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let id = drive(&mut fs, |fs| fs.fopen("GONE.TXT", FileMode::CREATE | FileMode::WRITE));
    drive(&mut fs, |fs| fs.fwrite(id, b"temporary"));
    drive(&mut fs, |fs| fs.funlink(id));

    let id = drive(&mut fs, |fs| fs.fopen("GONE.TXT", FileMode::CREATE | FileMode::WRITE));
    let n = drive(&mut fs, |fs| fs.fread(id, &mut [0u8; 1]));
    assert_eq!(n, 0, "recreated file should start empty, not see the deleted one's bytes");
}

#[test]
fn funlink_reclaims_cluster_space_so_repeated_cycles_never_exhaust_the_volume() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    // Each cycle writes enough to span several clusters. Run past the
    // point where the volume's total cluster count would be consumed if
    // funlink left the chain allocated — this only stays afloat if every
    // cycle's clusters are actually returned to the FAT.
    let payload = vec![0x42u8; 3_000];
    for _ in 0..200 {
        let id = drive(&mut fs, |fs| fs.fopen("CYCLE.BIN", FileMode::CREATE | FileMode::WRITE));
        drive(&mut fs, |fs| fs.fwrite(id, &payload));
        drive(&mut fs, |fs| fs.funlink(id));
        assert!(!fs.is_full(), "volume reported full despite funlink reclaiming space");
    }
}
