use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TEST_OUTPUT_DIR: &str = "test_output";

/// `<workspace>/test_output`, created on first use.
pub fn test_output_dir() -> &'static Path {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        // `common` sits directly under the workspace root.
        let dir = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap_or(Path::new("."))
            .join(TEST_OUTPUT_DIR);
        std::fs::create_dir_all(&dir)
            .unwrap_or_else(|e| panic!("Failed to create {}: {}", dir.display(), e));
        dir
    })
}

/// Path for a file written by a test, e.g. a saved solver config.
pub fn test_output_path(name: &str) -> PathBuf {
    test_output_dir().join(name)
}
