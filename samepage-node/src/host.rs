//! File-backed host: each page is a JSON `DocumentView` in the data directory.

use std::path::{Path, PathBuf};

use samepage_core::{DocumentView, HostApp, HostError, Patch};

pub struct FsHost {
    dir: PathBuf,
}

impl FsHost {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Overwrite a page, as a user editing it in the host would.
    pub fn write_page(&self, page: &str, view: &DocumentView) -> Result<(), HostError> {
        let json = serde_json::to_vec_pretty(view).map_err(|e| HostError(e.to_string()))?;
        std::fs::write(self.path(page), json).map_err(|e| HostError(format!("{}: {}", page, e)))
    }

    pub fn read_page(&self, page: &str) -> Result<DocumentView, HostError> {
        let bytes = std::fs::read(self.path(page)).map_err(|e| HostError(format!("{}: {}", page, e)))?;
        serde_json::from_slice(&bytes).map_err(|e| HostError(format!("{}: {}", page, e)))
    }

    fn path(&self, page: &str) -> PathBuf {
        let name: String = page
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl HostApp for FsHost {
    fn get_current_page_content(&mut self, page: &str) -> Result<DocumentView, HostError> {
        self.read_page(page)
    }

    fn apply_patch(&mut self, page: &str, patch: &Patch) -> Result<(), HostError> {
        let current = self.read_page(page)?;
        self.write_page(page, &patch.apply(&current))
    }

    fn create_local_page(&mut self, page: &str, title: &str) -> Result<(), HostError> {
        if self.path(page).exists() {
            return Ok(());
        }
        tracing::info!(%page, %title, "creating local page");
        self.write_page(page, &DocumentView::default())
    }

    fn delete_local_page(&mut self, page: &str) -> Result<(), HostError> {
        match std::fs::remove_file(self.path(page)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError(format!("{}: {}", page, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use samepage_core::PatchOp;

    fn temp_host() -> FsHost {
        let dir = std::env::temp_dir().join(format!("samepage-host-{}", uuid::Uuid::new_v4()));
        FsHost::new(dir).unwrap()
    }

    #[test]
    fn create_patch_read_delete() {
        let mut host = temp_host();
        host.create_local_page("daily/notes", "Notes").unwrap();
        assert_eq!(host.get_current_page_content("daily/notes").unwrap().text, "");
        let patch = Patch {
            ops: vec![PatchOp::Insert {
                index: 0,
                text: "hello".into(),
            }],
            annotations: None,
        };
        host.apply_patch("daily/notes", &patch).unwrap();
        assert_eq!(host.get_current_page_content("daily/notes").unwrap().text, "hello");
        host.delete_local_page("daily/notes").unwrap();
        assert!(host.get_current_page_content("daily/notes").is_err());
        host.delete_local_page("daily/notes").unwrap();
        std::fs::remove_dir_all(host.dir()).unwrap();
    }

    #[test]
    fn create_keeps_existing_content() {
        let mut host = temp_host();
        host.write_page("p", &DocumentView::new("kept")).unwrap();
        host.create_local_page("p", "P").unwrap();
        assert_eq!(host.read_page("p").unwrap().text, "kept");
        std::fs::remove_dir_all(host.dir()).unwrap();
    }
}
