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

use cardfat::FileMode;
use common::{drive, fat16_device, mount, Fs};

#[test]
fn file_created_inside_a_subdirectory_is_invisible_from_root() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let dir_id = drive(&mut fs, |fs| fs.mkdir("SUBDIR"));
    drive(&mut fs, |fs| fs.chdir(Some(dir_id)));

    let file_id = drive(&mut fs, |fs| fs.fopen("INNER.TXT", FileMode::CREATE | FileMode::WRITE));
    drive(&mut fs, |fs| fs.fwrite(file_id, b"nested"));
    drive(&mut fs, |fs| fs.fclose(file_id));

    drive(&mut fs, |fs| fs.chdir(None));

    // A plain (non-creating) open of the same name from root must fail:
    // the entry only exists in the subdirectory.
    match fs.fopen("INNER.TXT", FileMode::READ) {
        cardfat::Status::Failure => {}
        other => panic!("expected root lookup to fail, got {other:?}"),
    }
}

#[test]
fn many_files_in_a_subdirectory_force_a_directory_cluster_extension() {
    let mut fs: Fs = cardfat::Filesystem::new(fat16_device());
    mount(&mut fs);

    let dir_id = drive(&mut fs, |fs| fs.mkdir("MANY"));
    drive(&mut fs, |fs| fs.chdir(Some(dir_id)));

    // One 512-byte cluster holds 16 entries; "." and ".." already take two,
    // so the 15th new file forces allocate_directory_entry to extend the
    // directory by another cluster.
    for i in 0..20 {
        let name = format!("F{i:07}");
        let id = drive(&mut fs, |fs| fs.fopen(&name, FileMode::CREATE | FileMode::WRITE));
        drive(&mut fs, |fs| fs.fclose(id));
    }

    drive(&mut fs, |fs| fs.chdir(None));

    drive(&mut fs, |fs| fs.chdir(Some(dir_id)));
    let id = drive(&mut fs, |fs| fs.fopen("F0000019", FileMode::READ));
    assert_eq!(fs.ftell(id), 0);
}
