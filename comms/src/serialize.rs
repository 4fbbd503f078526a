use std::io;

pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to write the header and any encoded data into.
    ///
    /// # Returns
    /// A borrowed slice to be written right after `buf` without copying, if any.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
