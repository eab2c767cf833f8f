/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

#[cfg(test)]
pub mod email;
#[cfg(test)]
pub mod search;
#[cfg(test)]
pub mod store;

use std::path::PathBuf;

pub struct TempDir {
    pub path: PathBuf,
}

impl TempDir {
    pub fn new(name: &str, delete_if_exists: bool) -> Self {
        let path = std::env::temp_dir().join(format!("moggie-tests-{name}-{}", std::process::id()));
        if delete_if_exists && path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        std::fs::create_dir_all(&path).unwrap();
        TempDir { path }
    }

    pub fn delete(&self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
