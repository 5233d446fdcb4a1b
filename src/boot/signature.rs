//! Root image signature.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::layout::ROOT_IMAGE_MAGIC;

/// Whether `bytes` start with the squashfs superblock magic.
pub fn has_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(ROOT_IMAGE_MAGIC)
}

/// Whether the file at `path` is a root image. Short or missing files are not.
pub fn is_root_image(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(has_signature(&magic)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
