// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::RetestConfig;
use camino::Utf8Path;

/// Writes `contents` to `.config/retest.toml` under `project_root`.
pub(crate) fn write_config(project_root: &Utf8Path, contents: &str) {
    let config_path = project_root.join(RetestConfig::CONFIG_PATH);
    std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    std::fs::write(&config_path, contents).unwrap();
}
