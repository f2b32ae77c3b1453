//! Checksum helper shared by envelope codecs.

/// crc32 over the full byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(bytes);
  hasher.finalize()
}

#[cfg(test)]
mod tests {
  use super::crc32;

  #[test]
  fn stable_for_same_input() {
    assert_eq!(crc32(b"replikv"), crc32(b"replikv"));
    assert_ne!(crc32(b"replikv"), crc32(b"replikw"));
  }
}
