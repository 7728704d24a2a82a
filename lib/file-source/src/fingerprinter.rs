use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use bytes::Bytes;

/// The identity of a file: up to `fingerprint_size` bytes from its start.
///
/// A fingerprint shorter than the configured size belongs to a file that was
/// still small when it was taken. It is refreshed as the file grows and frozen
/// once it reaches the configured size.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(Bytes);

impl Fingerprint {
    pub fn new(first_bytes: impl Into<Bytes>) -> Self {
        Self(first_bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` could have been taken from the same file as `other`,
    /// at the same time or after it grew.
    ///
    /// Empty fingerprints carry no identity and never match anything.
    pub fn starts_with(&self, other: &Fingerprint) -> bool {
        !other.is_empty() && self.0.starts_with(&other.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Raw prefixes are noisy in logs; the length and a short preview is enough.
        let preview = &self.0[..self.0.len().min(16)];
        write!(
            f,
            "Fingerprint({} bytes, {:?})",
            self.0.len(),
            String::from_utf8_lossy(preview)
        )
    }
}

#[derive(Clone, Debug)]
pub struct Fingerprinter {
    pub bytes: usize,
}

impl Fingerprinter {
    pub const fn new(bytes: usize) -> Self {
        Self { bytes }
    }

    pub fn get_fingerprint_of_file(&self, path: &Path) -> io::Result<Fingerprint> {
        let file = File::open(path)?;
        self.get_fingerprint_of_handle(&file)
    }

    /// Fingerprint an already open handle. The handle's cursor is left
    /// wherever the read stopped; callers seek before their next read.
    pub fn get_fingerprint_of_handle(&self, mut file: &File) -> io::Result<Fingerprint> {
        file.seek(SeekFrom::Start(0))?;
        let mut buffer = Vec::with_capacity(self.bytes);
        file.take(self.bytes as u64).read_to_end(&mut buffer)?;
        Ok(Fingerprint::new(buffer))
    }

    /// Whether `fingerprint` has reached the configured size and is frozen.
    pub fn is_complete(&self, fingerprint: &Fingerprint) -> bool {
        fingerprint.len() >= self.bytes
    }
}

#[cfg(test)]
mod test {
    use std::{fs, io::Write};

    use tempfile::tempdir;

    use super::{Fingerprint, Fingerprinter};

    #[test]
    fn fingerprint_is_the_file_prefix() {
        let target_dir = tempdir().unwrap();
        let fingerprinter = Fingerprinter::new(8);

        let long_path = target_dir.path().join("long");
        fs::write(&long_path, b"hello world, this is long").unwrap();
        let short_path = target_dir.path().join("short");
        fs::write(&short_path, b"hi\n").unwrap();
        let empty_path = target_dir.path().join("empty");
        fs::write(&empty_path, b"").unwrap();

        let long = fingerprinter.get_fingerprint_of_file(&long_path).unwrap();
        assert_eq!(long.as_bytes(), b"hello wo");
        assert!(fingerprinter.is_complete(&long));

        let short = fingerprinter.get_fingerprint_of_file(&short_path).unwrap();
        assert_eq!(short.as_bytes(), b"hi\n");
        assert!(!fingerprinter.is_complete(&short));

        let empty = fingerprinter.get_fingerprint_of_file(&empty_path).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn short_fingerprint_grows_with_the_file() {
        let target_dir = tempdir().unwrap();
        let fingerprinter = Fingerprinter::new(16);
        let path = target_dir.path().join("growing");

        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"first\n").unwrap();
        let before = fingerprinter.get_fingerprint_of_file(&path).unwrap();

        file.write_all(b"second line\n").unwrap();
        let after = fingerprinter.get_fingerprint_of_file(&path).unwrap();

        assert_eq!(after.len(), 16);
        assert!(after.starts_with(&before));
        assert!(!before.starts_with(&after));
        assert_ne!(before, after);
    }

    #[test]
    fn empty_fingerprints_never_match() {
        let empty = Fingerprint::default();
        let other_empty = Fingerprint::new(Vec::new());
        let full = Fingerprint::new(&b"content"[..]);

        assert!(!empty.starts_with(&other_empty));
        assert!(!full.starts_with(&empty));
        assert!(!empty.starts_with(&full));
        assert!(full.starts_with(&full.clone()));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let target_dir = tempdir().unwrap();
        let fingerprinter = Fingerprinter::new(16);
        let missing = target_dir.path().join("missing");
        assert!(fingerprinter.get_fingerprint_of_file(&missing).is_err());
    }
}
