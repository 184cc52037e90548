//! In-memory tar builder

use tar::{Builder, EntryType, Header};

/// Builder for tar streams shaped like `git archive --format=tar` output
pub struct TestArchive {
    builder: Builder<Vec<u8>>,
}

impl TestArchive {
    pub fn new() -> Self {
        Self {
            builder: Builder::new(Vec::new()),
        }
    }

    /// Add a regular file
    pub fn add_file(mut self, path: &str, content: impl AsRef<[u8]>) -> Self {
        let content = content.as_ref();
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder
            .append_data(&mut header, path, content)
            .expect("Failed to append file");
        self
    }

    /// Add a directory entry
    pub fn add_dir(mut self, path: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("Failed to append directory");
        self
    }

    /// Add a symlink pointing at `target`
    pub fn add_symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        self.builder
            .append_link(&mut header, path, target)
            .expect("Failed to append symlink");
        self
    }

    /// Add a file whose name is written verbatim, bypassing tar-rs path checks
    pub fn add_raw_file(mut self, name: &str, content: impl AsRef<[u8]>) -> Self {
        let content = content.as_ref();
        let mut header = Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        self.builder
            .append(&header, content)
            .expect("Failed to append raw entry");
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.builder.into_inner().expect("Failed to finish archive")
    }
}
