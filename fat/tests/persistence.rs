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

//! A file written and closed on one `Filesystem` instance must be readable
//! from a second instance mounted over the same underlying sectors —
//! simulating a clean unmount/remount (e.g. across a power cycle) rather
//! than continued use of the same in-memory handle.

mod common;

use cardfat::FileMode;
use cardfat_device::SECTOR_SIZE;
use common::{drive, fat16_device, mount, Fs};

#[test]
fn data_survives_an_unmount_and_remount_cycle() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let id = drive(&mut fs, |fs| fs.fopen("SAVED.BIN", FileMode::CREATE | FileMode::WRITE));
    drive(&mut fs, |fs| fs.fwrite(id, b"durable contents"));
    drive(&mut fs, |fs| fs.fclose(id));

    while !fs.flush() {}

    let snapshot = fs.into_inner();

    let mut remounted: Fs = cardfat::Filesystem::new(snapshot);
    mount(&mut remounted);

    let id = drive(&mut remounted, |fs| fs.fopen("SAVED.BIN", FileMode::READ));
    let mut buf = [0u8; SECTOR_SIZE];
    let n = drive(&mut remounted, |fs| fs.fread(id, &mut buf));
    assert_eq!(&buf[..n], b"durable contents");
}
