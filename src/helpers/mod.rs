pub mod image_resolver;
pub mod picker;

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use self::picker::Picker;
use anyhow::Result;
use anyhow::bail;

/// Ask the user to pick one of `items` and return its text.
pub fn choose_one<S: ToString>(title: &str, items: Vec<S>) -> Result<String> {
    let display_items: Vec<String> = items.into_iter().map(|s| s.to_string()).collect();
    if display_items.is_empty() {
        bail!("Nothing to choose from for '{title}'");
    }

    let picker = Picker::new(title, display_items);
    if let Some(choice) = picker.invoke()? {
        Ok(choice)
    } else {
        bail!("No selection made");
    }
}

/// Write to a sibling temp file, then rename over `path`, creating parent
/// directories as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::write_atomic;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }
}
