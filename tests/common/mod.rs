#![allow(dead_code)]
//! Helpers shared by the integration suites.

pub mod fake_gcs;

use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness; `RUST_LOG` selects levels.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

pub fn all_files() -> Vec<PathBuf> {
    ["testfile1.txt", "testfile2.txt"]
        .iter()
        .map(|name| fixture_dir().join(name))
        .collect()
}

pub fn all_blobs() -> Vec<String> {
    vec!["testfile1.txt".to_string(), "testfile2.txt".to_string()]
}

pub fn assert_filenames_exist_in_directory(filenames: &[String], directory: &Path) {
    for filename in filenames {
        assert!(
            directory.join(filename).exists(),
            "{} missing from {}",
            filename,
            directory.display()
        );
    }
}
