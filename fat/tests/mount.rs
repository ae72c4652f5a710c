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

use cardfat::FilesystemState;
use common::{fat16_device, mount, Fs};

#[test]
fn fresh_volume_mounts_to_ready() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    assert_eq!(fs.state(), FilesystemState::Unmounted);
    mount(&mut fs);
    assert_eq!(fs.state(), FilesystemState::Ready);
}

#[cfg(feature = "freefile")]
#[test]
fn mounting_reserves_a_contiguous_freefile_block() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);
    assert!(fs.contiguous_free_space() > 0);
}

#[test]
fn mount_is_idempotent_after_destroy() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    for _ in 0..20_000 {
        if fs.destroy() {
            break;
        }
    }
    assert_eq!(fs.state(), FilesystemState::Unmounted);

    mount(&mut fs);
    assert_eq!(fs.state(), FilesystemState::Ready);
}
